//! # Precache Store
//!
//! Named-namespace response cache, modelled on the `caches` global of a
//! service worker.
//!
//! ## Architecture
//!
//! ```text
//! CacheStorage (caches)
//!     │  open / has / keys / delete / match_request
//!     └── Cache (one namespace, e.g. "cache-1700000000")
//!             └── cache key (absolute URL) → CacheEntry
//!
//! CacheBackend
//!     ├── MemoryBackend  (process lifetime)
//!     └── DiskBackend    (survives restarts)
//! ```
//!
//! Writes are atomic per key. Nothing coordinates writers beyond that.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use precache_net::{cache_key, Request, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;
use url::Url;

pub mod disk;
pub mod memory;

pub use disk::DiskBackend;
pub use memory::MemoryBackend;

// ==================== Errors ====================

/// Errors that can occur in cache storage operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt cache entry '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Only GET requests can be cached, got {0}")]
    UnsupportedMethod(String),
}

// ==================== Entries ====================

/// A cached response, in the form backends persist it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Cache key (absolute request URL without fragment).
    pub url: String,

    /// Request method. Always GET today.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response status text.
    pub status_text: String,

    /// Response headers, in wire order. Repeated names are kept.
    pub headers: Vec<(String, String)>,

    /// Response body. The disk backend stores it beside the metadata file.
    #[serde(skip)]
    pub body: Bytes,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Capture `response` under `key`.
    pub fn from_response(key: impl Into<String>, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        Self {
            url: key.into(),
            method: "GET".to_string(),
            status: response.status.as_u16(),
            status_text: response.status_text().to_string(),
            headers,
            body: response.body.clone(),
            cached_at: precache_common::now_millis(),
        }
    }

    /// Rebuild a response from this entry. Headers that no longer parse are
    /// dropped.
    pub fn to_response(&self) -> Result<Response, StoreError> {
        let url = Url::parse(&self.url).map_err(|e| StoreError::Corrupt {
            key: self.url.clone(),
            reason: e.to_string(),
        })?;
        let status = StatusCode::from_u16(self.status).map_err(|e| StoreError::Corrupt {
            key: self.url.clone(),
            reason: e.to_string(),
        })?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(n, v);
            }
        }

        Ok(Response {
            url,
            status,
            headers,
            body: self.body.clone(),
            from_cache: true,
        })
    }
}

// ==================== Backend ====================

/// Storage behind [`CacheStorage`].
///
/// Reading a namespace that does not exist yields nothing rather than an
/// error. Writing to one stores nothing.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Create the namespace if it does not exist.
    async fn open(&self, name: &str) -> Result<(), StoreError>;

    /// Whether the namespace exists.
    async fn has(&self, name: &str) -> Result<bool, StoreError>;

    /// Names of every namespace.
    async fn names(&self) -> Result<Vec<String>, StoreError>;

    /// Delete a namespace and all its entries. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool, StoreError>;

    /// Look up one entry.
    async fn get(&self, name: &str, key: &str) -> Result<Option<CacheEntry>, StoreError>;

    /// Insert or replace entries, keyed by `CacheEntry::url`. Either every
    /// entry is stored or none is.
    ///
    /// Only [`open`](Self::open) creates namespaces: if `name` does not
    /// exist nothing is written and `false` is returned.
    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<bool, StoreError>;

    /// Delete one entry. Returns whether it existed.
    async fn delete_entry(&self, name: &str, key: &str) -> Result<bool, StoreError>;

    /// Keys of every entry in the namespace.
    async fn entry_keys(&self, name: &str) -> Result<Vec<String>, StoreError>;
}

// ==================== Cache ====================

/// Handle to one namespace.
#[derive(Clone)]
pub struct Cache {
    name: String,
    backend: Arc<dyn CacheBackend>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").field("name", &self.name).finish()
    }
}

impl Cache {
    /// Namespace name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Match a request. Only GET requests ever match.
    pub async fn match_request(&self, request: &Request) -> Result<Option<Response>, StoreError> {
        if !request.is_get() {
            return Ok(None);
        }
        self.match_key(&request.cache_key()).await
    }

    /// Match by URL.
    pub async fn match_url(&self, url: &Url) -> Result<Option<Response>, StoreError> {
        self.match_key(&cache_key(url)).await
    }

    /// Match by raw cache key.
    pub async fn match_key(&self, key: &str) -> Result<Option<Response>, StoreError> {
        let entry = self.backend.get(&self.name, key).await?;
        trace!(cache = %self.name, key, hit = entry.is_some(), "Cache lookup");
        entry.map(|e| e.to_response()).transpose()
    }

    /// Store `response` for `request`. Returns `false`, storing nothing, if
    /// the namespace has been deleted since this handle was opened.
    pub async fn put(&self, request: &Request, response: &Response) -> Result<bool, StoreError> {
        if !request.is_get() {
            return Err(StoreError::UnsupportedMethod(request.method.to_string()));
        }
        let entry = CacheEntry::from_response(request.cache_key(), response);
        self.backend.put_all(&self.name, vec![entry]).await
    }

    /// Store several `(url, response)` pairs in one call. Same return as
    /// [`put`](Self::put).
    pub async fn put_all(&self, pairs: &[(Url, Response)]) -> Result<bool, StoreError> {
        let entries = pairs
            .iter()
            .map(|(url, response)| CacheEntry::from_response(cache_key(url), response))
            .collect();
        self.backend.put_all(&self.name, entries).await
    }

    /// Delete the entry for `request`.
    pub async fn delete(&self, request: &Request) -> Result<bool, StoreError> {
        self.backend
            .delete_entry(&self.name, &request.cache_key())
            .await
    }

    /// Keys of every entry.
    pub async fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.backend.entry_keys(&self.name).await
    }
}

// ==================== Cache Storage ====================

/// The `caches` global: every namespace, over one backend.
#[derive(Clone)]
pub struct CacheStorage {
    backend: Arc<dyn CacheBackend>,
}

impl std::fmt::Debug for CacheStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStorage").finish_non_exhaustive()
    }
}

impl CacheStorage {
    /// Wrap a backend.
    pub fn new(backend: impl CacheBackend + 'static) -> Self {
        Self::from_backend(Arc::new(backend))
    }

    /// Wrap a shared backend.
    pub fn from_backend(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    /// Storage that lives as long as the process.
    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new())
    }

    /// Open a cache (creates if doesn't exist).
    pub async fn open(&self, name: &str) -> Result<Cache, StoreError> {
        self.backend.open(name).await?;
        Ok(Cache {
            name: name.to_string(),
            backend: Arc::clone(&self.backend),
        })
    }

    /// Check if cache exists.
    pub async fn has(&self, name: &str) -> Result<bool, StoreError> {
        self.backend.has(name).await
    }

    /// Delete a cache.
    pub async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        self.backend.delete(name).await
    }

    /// Get all cache names.
    pub async fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.backend.names().await
    }

    /// Match across all caches, in `keys()` order.
    pub async fn match_request(&self, request: &Request) -> Result<Option<Response>, StoreError> {
        if !request.is_get() {
            return Ok(None);
        }
        let key = request.cache_key();
        for name in self.backend.names().await? {
            if let Some(entry) = self.backend.get(&name, &key).await? {
                return entry.to_response().map(Some);
            }
        }
        Ok(None)
    }
}
