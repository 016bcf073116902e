//! Shared fixtures for worker tests.

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use http::StatusCode;
use precache_net::{Fetched, Fetcher, NetError, Request, Response};
use precache_store::{CacheBackend, CacheEntry, CacheStorage, MemoryBackend, StoreError};
use precache_sw::{AssetList, CacheLifecycleHandler, CacheName};
use tokio::sync::{RwLock, RwLockWriteGuard};
use url::Url;

pub const ORIGIN: &str = "https://app.example/";

pub fn scope() -> Url {
    Url::parse(ORIGIN).unwrap()
}

pub fn url(path: &str) -> Url {
    scope().join(path).unwrap()
}

/// How the scripted network answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Online,
    /// Every fetch errors.
    Offline,
    /// Every fetch resolves without a response.
    Degenerate,
}

/// A network that answers from a route table and records every request.
pub struct ScriptedFetcher {
    routes: Mutex<HashMap<String, (StatusCode, Bytes)>>,
    network: Mutex<Network>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(HashMap::new()),
            network: Mutex::new(Network::Online),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Serve `body` with `status` for `path` under [`ORIGIN`]. Query strings
    /// are part of the route.
    pub fn route(&self, path: &str, status: u16, body: &str) {
        self.routes.lock().unwrap().insert(
            url(path).to_string(),
            (
                StatusCode::from_u16(status).unwrap(),
                Bytes::copy_from_slice(body.as_bytes()),
            ),
        );
    }

    pub fn set_network(&self, network: Network) {
        *self.network.lock().unwrap() = network;
    }

    /// Every URL fetched so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: &Request) -> Result<Fetched, NetError> {
        self.calls.lock().unwrap().push(request.url.to_string());

        let network = *self.network.lock().unwrap();
        match network {
            Network::Offline => Err(NetError::RequestFailed("connection refused".to_string())),
            Network::Degenerate => Ok(Fetched::Degenerate),
            Network::Online => {
                let routed = self.routes.lock().unwrap().get(request.url.as_str()).cloned();
                let (status, body) =
                    routed.unwrap_or((StatusCode::NOT_FOUND, Bytes::from_static(b"not found")));
                Ok(Fetched::Response(Response::new(
                    request.url.clone(),
                    status,
                    body,
                )))
            }
        }
    }
}

/// In-memory storage whose writes and namespace deletions can be made to
/// fail, and whose writes can be held back.
pub struct FlakyBackend {
    inner: MemoryBackend,
    fail_writes: AtomicBool,
    undeletable: Mutex<HashSet<String>>,
    gate: RwLock<()>,
}

impl FlakyBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryBackend::new(),
            fail_writes: AtomicBool::new(false),
            undeletable: Mutex::new(HashSet::new()),
            gate: RwLock::new(()),
        })
    }

    pub fn storage(self: &Arc<Self>) -> CacheStorage {
        CacheStorage::from_backend(self.clone())
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn refuse_delete(&self, name: &str) {
        self.undeletable.lock().unwrap().insert(name.to_string());
    }

    /// Writes wait until the returned guard is dropped.
    pub async fn hold_writes(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write().await
    }
}

#[async_trait]
impl CacheBackend for FlakyBackend {
    async fn open(&self, name: &str) -> Result<(), StoreError> {
        self.inner.open(name).await
    }

    async fn has(&self, name: &str) -> Result<bool, StoreError> {
        self.inner.has(name).await
    }

    async fn names(&self) -> Result<Vec<String>, StoreError> {
        self.inner.names().await
    }

    async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        if self.undeletable.lock().unwrap().contains(name) {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "namespace is locked",
            )));
        }
        self.inner.delete(name).await
    }

    async fn get(&self, name: &str, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        self.inner.get(name, key).await
    }

    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<bool, StoreError> {
        let _gate = self.gate.read().await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::Other,
                "no space left on device",
            )));
        }
        self.inner.put_all(name, entries).await
    }

    async fn delete_entry(&self, name: &str, key: &str) -> Result<bool, StoreError> {
        self.inner.delete_entry(name, key).await
    }

    async fn entry_keys(&self, name: &str) -> Result<Vec<String>, StoreError> {
        self.inner.entry_keys(name).await
    }
}

/// A fetcher with one route per asset, body `"<version>:<path>"`.
pub fn fetcher_for(version: &str, assets: &[&str]) -> Arc<ScriptedFetcher> {
    let fetcher = ScriptedFetcher::new();
    for path in assets {
        fetcher.route(path, 200, &format!("{version}:{path}"));
    }
    fetcher
}

pub fn handler(
    version: &str,
    assets: &[&str],
    caches: &CacheStorage,
    fetcher: Arc<ScriptedFetcher>,
) -> CacheLifecycleHandler {
    CacheLifecycleHandler::new(
        CacheName::for_version("cache-", version),
        AssetList::new(assets.iter().map(|p| p.to_string())),
        scope(),
        caches.clone(),
        fetcher,
    )
    .unwrap()
}

/// Body of a response as a string.
pub fn body(response: &Response) -> String {
    response.text().unwrap()
}
