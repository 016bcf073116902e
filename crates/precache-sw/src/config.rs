//! Worker configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use precache_net::LoaderConfig;
use precache_store::{CacheStorage, DiskBackend};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::manifest::{BuildManifest, CacheName, DEFAULT_CACHE_PREFIX};
use crate::ServiceWorkerError;

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Scope URL. Asset paths resolve against it.
    pub scope: Url,

    /// Prefix for the cache namespace name
    #[serde(default = "default_cache_prefix")]
    pub cache_prefix: String,

    /// Where cached responses live
    #[serde(default)]
    pub storage: StorageConfig,

    /// Network settings
    #[serde(default)]
    pub loader: LoaderSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Lost when the process exits
    Memory,
    /// Persisted under `path`
    Disk { path: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderSettings {
    /// User agent override
    pub user_agent: Option<String>,

    /// Client timeout in seconds; `None` disables it
    pub timeout_secs: Option<u64>,

    /// Maximum redirects to follow
    pub max_redirects: usize,
}

fn default_cache_prefix() -> String {
    DEFAULT_CACHE_PREFIX.to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Disk {
            path: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("precache"),
        }
    }
}

impl Default for LoaderSettings {
    fn default() -> Self {
        let defaults = LoaderConfig::default();
        Self {
            user_agent: None,
            timeout_secs: defaults.timeout.map(|t| t.as_secs()),
            max_redirects: defaults.max_redirects,
        }
    }
}

impl WorkerConfig {
    /// Defaults for everything but the scope.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            cache_prefix: default_cache_prefix(),
            storage: StorageConfig::default(),
            loader: LoaderSettings::default(),
        }
    }

    /// Parse a JSON config.
    pub fn from_json_str(raw: &str) -> Result<Self, ServiceWorkerError> {
        serde_json::from_str(raw).map_err(|e| ServiceWorkerError::Config(e.to_string()))
    }

    /// Read a JSON config from disk.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, ServiceWorkerError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ServiceWorkerError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&raw)
    }

    /// Cache name for `manifest` under this config's prefix.
    pub fn cache_name(&self, manifest: &BuildManifest) -> CacheName {
        CacheName::for_version(&self.cache_prefix, &manifest.version)
    }

    /// Construct the configured cache storage.
    pub async fn build_storage(&self) -> Result<CacheStorage, ServiceWorkerError> {
        match &self.storage {
            StorageConfig::Memory => Ok(CacheStorage::in_memory()),
            StorageConfig::Disk { path } => {
                Ok(CacheStorage::new(DiskBackend::open_root(path).await?))
            }
        }
    }

    /// Loader configuration for the network fetcher.
    pub fn loader_config(&self) -> LoaderConfig {
        let mut config = LoaderConfig {
            timeout: self.loader.timeout_secs.map(Duration::from_secs),
            max_redirects: self.loader.max_redirects,
            ..LoaderConfig::default()
        };
        if let Some(ref ua) = self.loader.user_agent {
            config.user_agent = ua.clone();
        }
        config
    }
}
