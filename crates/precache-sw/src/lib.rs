//! # Precache Service Worker
//!
//! Install-time asset precaching and offline-fallback fetch handling for a
//! web application's service worker.
//!
//! ## Features
//!
//! - **install**: fetch every asset of the deployment into `cache-<version>`
//! - **activate**: delete every cache namespace from older deployments
//! - **fetch**: cache-first for known assets, network-first with cache
//!   fallback for everything else, pass-through for non-GET requests
//! - **message**: `{ "type": "SKIP_WAITING" }` activates a waiting worker
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerHost
//!     ├── ServiceWorkerRegistration
//!     │       ├── installing (ServiceWorker)
//!     │       ├── waiting    (ServiceWorker)
//!     │       └── active     (ServiceWorker)
//!     └── CacheLifecycleHandler (one per live worker)
//!             ├── CacheStorage  (precache-store)
//!             └── dyn Fetcher   (precache-net)
//! ```

use precache_store::StoreError;
use thiserror::Error;

pub mod config;
pub mod handler;
pub mod host;
pub mod manifest;
pub mod registration;

pub use config::{LoaderSettings, StorageConfig, WorkerConfig};
pub use handler::{
    CacheLifecycleHandler, ControlMessage, EventOutcome, FetchDisposition, WorkerEvent,
};
pub use host::{HostEvent, ServiceWorkerHost};
pub use manifest::{AssetList, BuildManifest, CacheName, ResolvedAssets, DEFAULT_CACHE_PREFIX};
pub use registration::{
    ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState,
    RETIRED_HISTORY,
};

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Install failed fetching {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    #[error("Offline! Please connect to the internet to continue.")]
    Offline,

    #[error("Cache error: {0}")]
    Cache(#[from] StoreError),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl ServiceWorkerError {
    /// Whether this is the "offline, no cached copy" failure.
    pub fn is_offline(&self) -> bool {
        matches!(self, ServiceWorkerError::Offline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_message() {
        let err = ServiceWorkerError::Offline;
        assert!(err.is_offline());
        assert_eq!(
            err.to_string(),
            "Offline! Please connect to the internet to continue."
        );
    }

    #[test]
    fn test_install_failed_message() {
        let err = ServiceWorkerError::InstallFailed {
            url: "https://example.com/app.js".to_string(),
            reason: "bad status 404 Not Found".to_string(),
        };
        assert!(!err.is_offline());
        assert!(err.to_string().contains("https://example.com/app.js"));
    }
}
