//! Build manifest: deployment version and the paths to precache.

use std::path::Path;
use std::sync::Arc;

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::ServiceWorkerError;

/// Default prefix for cache namespace names.
pub const DEFAULT_CACHE_PREFIX: &str = "cache-";

/// What the build step hands the worker.
///
/// ```json
/// { "version": "1700000000000",
///   "build": ["/_app/immutable/start.js"],
///   "files": ["/favicon.png"],
///   "prerendered": ["/about"] }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildManifest {
    /// Deployment version.
    pub version: String,

    /// Build output (the app itself).
    #[serde(default)]
    pub build: Vec<String>,

    /// Everything in the static directory.
    #[serde(default)]
    pub files: Vec<String>,

    /// Prerendered pages.
    #[serde(default)]
    pub prerendered: Vec<String>,
}

impl BuildManifest {
    /// Parse and validate a JSON manifest.
    pub fn from_json_str(raw: &str) -> Result<Self, ServiceWorkerError> {
        let manifest: Self = serde_json::from_str(raw)
            .map_err(|e| ServiceWorkerError::Manifest(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Read a JSON manifest from disk.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, ServiceWorkerError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            ServiceWorkerError::Manifest(format!("{}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    /// Version must be non-empty and every path absolute.
    pub fn validate(&self) -> Result<(), ServiceWorkerError> {
        if self.version.trim().is_empty() {
            return Err(ServiceWorkerError::Manifest("empty version".to_string()));
        }
        if let Some(bad) = self.all_paths().find(|p| !p.starts_with('/')) {
            return Err(ServiceWorkerError::Manifest(format!(
                "asset path '{bad}' must start with '/'"
            )));
        }
        Ok(())
    }

    fn all_paths(&self) -> impl Iterator<Item = &String> {
        self.build
            .iter()
            .chain(self.files.iter())
            .chain(self.prerendered.iter())
    }

    /// Cache name with the default prefix, `cache-<version>`.
    pub fn cache_name(&self) -> CacheName {
        CacheName::for_version(DEFAULT_CACHE_PREFIX, &self.version)
    }

    /// Build, static files, then prerendered pages.
    pub fn assets(&self) -> AssetList {
        AssetList::new(self.all_paths().cloned())
    }
}

/// Version-scoped cache namespace name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheName(String);

impl CacheName {
    pub fn for_version(prefix: &str, version: &str) -> Self {
        Self(format!("{prefix}{version}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for CacheName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

/// Ordered, immutable list of asset paths. Duplicates keep their first
/// position.
#[derive(Debug, Clone, Default)]
pub struct AssetList {
    paths: Arc<[String]>,
}

impl AssetList {
    pub fn new(paths: impl IntoIterator<Item = String>) -> Self {
        let mut seen = HashSet::new();
        let paths: Vec<String> = paths
            .into_iter()
            .filter(|p| {
                let fresh = seen.insert(p.clone());
                if !fresh {
                    debug!(path = %p, "Dropping duplicate asset path");
                }
                fresh
            })
            .collect();
        Self {
            paths: paths.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    /// Resolve every path against `scope`.
    pub fn resolve(&self, scope: &Url) -> Result<ResolvedAssets, ServiceWorkerError> {
        let urls = self
            .paths
            .iter()
            .map(|p| scope.join(p))
            .collect::<Result<Vec<_>, _>>()?;
        let paths = urls.iter().map(|u| u.path().to_string()).collect();
        Ok(ResolvedAssets { urls, paths })
    }
}

/// Asset list resolved to absolute URLs, with a path index for membership.
#[derive(Debug, Clone)]
pub struct ResolvedAssets {
    urls: Vec<Url>,
    paths: HashSet<String>,
}

impl ResolvedAssets {
    /// URLs in asset list order.
    pub fn urls(&self) -> &[Url] {
        &self.urls
    }

    /// Whether a URL path (as `Url::path` reports it) is a known asset.
    pub fn contains_path(&self, path: &str) -> bool {
        self.paths.contains(path)
    }
}
