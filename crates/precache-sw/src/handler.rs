//! The cache lifecycle handler: install, activate, fetch and message.

use std::sync::Arc;

use futures::future::try_join_all;
use http::StatusCode;
use precache_net::{Fetched, Fetcher, Request, Response};
use precache_store::{Cache, CacheStorage};
use serde_json::Value as JsonValue;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::WorkerConfig;
use crate::manifest::{AssetList, BuildManifest, CacheName, ResolvedAssets};
use crate::ServiceWorkerError;

/// How a fetch event was answered.
#[derive(Debug, Clone)]
pub enum FetchDisposition {
    /// Not intercepted. The host performs its default handling.
    Passthrough,
    /// Answered with this response (`respondWith`).
    Respond(Response),
}

impl FetchDisposition {
    /// The response, if the handler produced one.
    pub fn response(&self) -> Option<&Response> {
        match self {
            FetchDisposition::Passthrough => None,
            FetchDisposition::Respond(response) => Some(response),
        }
    }
}

/// Recognised page → worker control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// `{ "type": "SKIP_WAITING" }`
    SkipWaiting,
}

impl ControlMessage {
    /// Anything other than an object whose `type` is exactly `SKIP_WAITING`
    /// is not a control message.
    pub fn from_payload(payload: &JsonValue) -> Option<Self> {
        match payload.as_object()?.get("type")?.as_str()? {
            "SKIP_WAITING" => Some(Self::SkipWaiting),
            _ => None,
        }
    }
}

/// A lifecycle event delivered to one worker version.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(Request),
    Message(JsonValue),
}

/// What handling a [`WorkerEvent`] produced.
#[derive(Debug, Clone)]
pub enum EventOutcome {
    Installed,
    /// Namespaces removed during activation.
    Activated { deleted: Vec<String> },
    Fetch(FetchDisposition),
    Message(Option<ControlMessage>),
}

/// Per-version handler bound to the install, activate, fetch and message
/// events.
pub struct CacheLifecycleHandler {
    cache_name: CacheName,
    assets: AssetList,
    resolved: ResolvedAssets,
    scope: Url,
    caches: CacheStorage,
    fetcher: Arc<dyn Fetcher>,
    writes: TaskTracker,
}

impl std::fmt::Debug for CacheLifecycleHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLifecycleHandler")
            .field("cache_name", &self.cache_name)
            .field("assets", &self.assets.len())
            .field("scope", &self.scope.as_str())
            .finish_non_exhaustive()
    }
}

impl CacheLifecycleHandler {
    /// Create a handler for one deployment.
    pub fn new(
        cache_name: CacheName,
        assets: AssetList,
        scope: Url,
        caches: CacheStorage,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, ServiceWorkerError> {
        let resolved = assets.resolve(&scope)?;
        Ok(Self {
            cache_name,
            assets,
            resolved,
            scope,
            caches,
            fetcher,
            writes: TaskTracker::new(),
        })
    }

    /// Create a handler from a manifest and a worker config.
    pub fn from_manifest(
        config: &WorkerConfig,
        manifest: &BuildManifest,
        caches: CacheStorage,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, ServiceWorkerError> {
        Self::new(
            config.cache_name(manifest),
            manifest.assets(),
            config.scope.clone(),
            caches,
            fetcher,
        )
    }

    pub fn cache_name(&self) -> &CacheName {
        &self.cache_name
    }

    pub fn assets(&self) -> &AssetList {
        &self.assets
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    /// Route an event to its binding.
    pub async fn dispatch(&self, event: WorkerEvent) -> Result<EventOutcome, ServiceWorkerError> {
        match event {
            WorkerEvent::Install => {
                self.install().await?;
                Ok(EventOutcome::Installed)
            }
            WorkerEvent::Activate => Ok(EventOutcome::Activated {
                deleted: self.activate().await?,
            }),
            WorkerEvent::Fetch(request) => Ok(EventOutcome::Fetch(self.fetch(&request).await?)),
            WorkerEvent::Message(payload) => Ok(EventOutcome::Message(self.message(&payload))),
        }
    }

    async fn open_cache(&self) -> Result<Cache, ServiceWorkerError> {
        Ok(self.caches.open(self.cache_name.as_str()).await?)
    }

    /// Install: fetch every asset and store them all in the current
    /// namespace. Any failed fetch or non-2xx status fails the install and
    /// nothing is written.
    #[instrument(skip(self), fields(cache = %self.cache_name))]
    pub async fn install(&self) -> Result<(), ServiceWorkerError> {
        let cache = self.open_cache().await?;

        let fetches = self.resolved.urls().iter().map(|url| async move {
            let request = Request::get(url.clone());
            let fetched = self.fetcher.fetch(&request).await.map_err(|e| {
                ServiceWorkerError::InstallFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            })?;
            match fetched {
                Fetched::Response(response) if response.ok() => {
                    Ok::<_, ServiceWorkerError>((url.clone(), response))
                }
                Fetched::Response(response) => Err(ServiceWorkerError::InstallFailed {
                    url: url.to_string(),
                    reason: format!("bad status {}", response.status),
                }),
                Fetched::Degenerate => Err(ServiceWorkerError::InstallFailed {
                    url: url.to_string(),
                    reason: "no response".to_string(),
                }),
            }
        });

        let pairs = try_join_all(fetches).await?;
        if !cache.put_all(&pairs).await? {
            return Err(ServiceWorkerError::State(format!(
                "{} was deleted during install",
                self.cache_name
            )));
        }

        info!(assets = pairs.len(), "Precached assets");
        Ok(())
    }

    /// Activate: delete every namespace except the current one. Returns the
    /// names that were deleted. A failed deletion is logged and skipped.
    #[instrument(skip(self), fields(cache = %self.cache_name))]
    pub async fn activate(&self) -> Result<Vec<String>, ServiceWorkerError> {
        let mut deleted = Vec::new();
        for name in self.caches.keys().await? {
            if self.cache_name.as_str() == name {
                continue;
            }
            match self.caches.delete(&name).await {
                Ok(_) => deleted.push(name),
                Err(e) => warn!(cache = %name, error = %e, "Failed to delete old cache"),
            }
        }

        info!(deleted = deleted.len(), "Removed old caches");
        Ok(deleted)
    }

    /// Fetch: cache-first for known assets, network-first with cache
    /// fallback for every other GET. Non-GET requests pass through.
    pub async fn fetch(&self, request: &Request) -> Result<FetchDisposition, ServiceWorkerError> {
        if !request.is_get() {
            debug!(url = %request.url, method = %request.method, "Not intercepting");
            return Ok(FetchDisposition::Passthrough);
        }

        let cache = self.open_cache().await?;

        if self.resolved.contains_path(request.url.path()) {
            let asset_url = self.scope.join(request.url.path())?;
            if let Some(hit) = cache.match_url(&asset_url).await? {
                debug!(url = %request.url, "Serving precached asset");
                return Ok(FetchDisposition::Respond(hit));
            }
            debug!(url = %request.url, "Precached asset missing, trying network");
        }

        match self.fetcher.fetch(request).await {
            Ok(Fetched::Response(response)) => {
                if response.status == StatusCode::OK {
                    self.store_detached(cache, request.clone(), response.clone());
                }
                return Ok(FetchDisposition::Respond(response));
            }
            Ok(Fetched::Degenerate) => {
                debug!(url = %request.url, "Fetch resolved without a response");
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network unavailable");
            }
        }

        match cache.match_request(request).await? {
            Some(hit) => {
                debug!(url = %request.url, "Serving cached copy while offline");
                Ok(FetchDisposition::Respond(hit))
            }
            None => Err(ServiceWorkerError::Offline),
        }
    }

    /// Message: recognise `SKIP_WAITING`, ignore everything else.
    pub fn message(&self, payload: &JsonValue) -> Option<ControlMessage> {
        let message = ControlMessage::from_payload(payload);
        if message.is_none() {
            debug!("Ignoring unrecognised message");
        }
        message
    }

    /// Write a live response to the cache off the response path. Failures
    /// are logged and dropped. A write that lands after activation deleted
    /// the namespace is dropped too.
    fn store_detached(&self, cache: Cache, request: Request, response: Response) {
        self.writes.spawn(async move {
            match cache.put(&request, &response).await {
                Ok(true) => {}
                Ok(false) => debug!(
                    cache = cache.name(),
                    key = %request.cache_key(),
                    "Cache deleted, dropping write"
                ),
                Err(e) => warn!(
                    key = %request.cache_key(),
                    error = %e,
                    "Background cache write failed"
                ),
            }
        });
    }

    /// Wait for every background cache write started so far.
    pub async fn flush(&self) {
        self.writes.close();
        self.writes.wait().await;
        self.writes.reopen();
    }
}
