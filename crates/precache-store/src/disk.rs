//! Persistent on-disk cache backend.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/
//!     <hex(namespace)>/
//!         <sha256(key)>.json   metadata (CacheEntry without body)
//!         <sha256(key)>.body   raw body bytes
//! ```
//!
//! A batch is written in two phases. Every file is first staged under a
//! temporary name, then each is renamed into place, body before metadata, so
//! an entry becomes visible only once its body is complete. If staging or a
//! rename fails, whatever the batch already put in place is removed again.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, warn};

use crate::{CacheBackend, CacheEntry, StoreError};

const META_EXT: &str = "json";
const BODY_EXT: &str = "body";

/// Backend that persists namespaces as directories.
#[derive(Debug, Clone)]
pub struct DiskBackend {
    root: PathBuf,
}

impl DiskBackend {
    /// Use `root` as the storage directory, creating it if needed.
    pub async fn open_root(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "Disk cache backend ready");
        Ok(Self { root })
    }

    /// Storage directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, name: &str) -> PathBuf {
        self.root.join(hex::encode(name.as_bytes()))
    }

    fn entry_stem(key: &str) -> String {
        hex::encode(Sha256::digest(key.as_bytes()))
    }

    fn entry_paths(&self, name: &str, key: &str) -> (PathBuf, PathBuf) {
        let dir = self.namespace_dir(name);
        let stem = Self::entry_stem(key);
        (
            dir.join(format!("{stem}.{META_EXT}")),
            dir.join(format!("{stem}.{BODY_EXT}")),
        )
    }

    /// Stage the body and metadata of one entry. Returns
    /// `(temporary, destination)` pairs, body first.
    async fn stage_entry(
        &self,
        name: &str,
        entry: &CacheEntry,
    ) -> Result<[(PathBuf, PathBuf); 2], StoreError> {
        let (meta_path, body_path) = self.entry_paths(name, &entry.url);
        let meta = serde_json::to_vec(entry)?;
        let body_tmp = stage(&body_path, &entry.body).await?;
        match stage(&meta_path, &meta).await {
            Ok(meta_tmp) => Ok([(body_tmp, body_path), (meta_tmp, meta_path)]),
            Err(e) => {
                discard(&[body_tmp]).await;
                Err(e)
            }
        }
    }

    /// A write that failed because the namespace was deleted underneath it
    /// is a dropped write, not an error.
    async fn missing_or(&self, name: &str, err: StoreError) -> Result<bool, StoreError> {
        if self.has(name).await? {
            Err(err)
        } else {
            Ok(false)
        }
    }

    async fn read_meta(path: &Path) -> Result<Option<CacheEntry>, StoreError> {
        match fs::read(path).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write `contents` to a temporary sibling of `path` and return its name.
async fn stage(path: &Path, contents: &[u8]) -> Result<PathBuf, StoreError> {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let tmp = path.with_extension(format!(
        "tmp-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    if let Err(e) = fs::write(&tmp, contents).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(tmp)
}

/// Best-effort removal of files a failed batch left behind.
async fn discard(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = fs::remove_file(path).await {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to clean up cache file");
            }
        }
    }
}

async fn remove_if_exists(path: &Path) -> Result<bool, StoreError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl CacheBackend for DiskBackend {
    async fn open(&self, name: &str) -> Result<(), StoreError> {
        fs::create_dir_all(self.namespace_dir(name)).await?;
        Ok(())
    }

    async fn has(&self, name: &str) -> Result<bool, StoreError> {
        match fs::metadata(self.namespace_dir(name)).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Namespace names, sorted. Directories whose names are not hex-encoded
    /// UTF-8 are skipped.
    async fn names(&self) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let file_name = entry.file_name();
            let decoded = file_name
                .to_str()
                .and_then(|s| hex::decode(s).ok())
                .and_then(|raw| String::from_utf8(raw).ok());
            match decoded {
                Some(name) => names.push(name),
                None => warn!(dir = ?file_name, "Skipping unrecognised cache directory"),
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        match fs::remove_dir_all(self.namespace_dir(name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, name: &str, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let (meta_path, body_path) = self.entry_paths(name, key);
        let Some(mut entry) = Self::read_meta(&meta_path).await? else {
            return Ok(None);
        };

        if entry.url != key {
            return Err(StoreError::Corrupt {
                key: key.to_string(),
                reason: format!("metadata belongs to '{}'", entry.url),
            });
        }

        entry.body = match fs::read(&body_path).await {
            Ok(raw) => Bytes::from(raw),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::Corrupt {
                    key: key.to_string(),
                    reason: "body file missing".to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Some(entry))
    }

    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<bool, StoreError> {
        if !self.has(name).await? {
            return Ok(false);
        }

        let mut staged: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(entries.len() * 2);
        for entry in &entries {
            match self.stage_entry(name, entry).await {
                Ok(pair) => staged.extend(pair),
                Err(e) => {
                    let temps: Vec<PathBuf> = staged.into_iter().map(|(tmp, _)| tmp).collect();
                    discard(&temps).await;
                    return self.missing_or(name, e).await;
                }
            }
        }

        for (i, (tmp, dest)) in staged.iter().enumerate() {
            if let Err(e) = fs::rename(tmp, dest).await {
                warn!(cache = name, error = %e, "Rolling back partially written batch");
                let placed: Vec<PathBuf> = staged[..i].iter().map(|(_, d)| d.clone()).collect();
                let pending: Vec<PathBuf> = staged[i..].iter().map(|(t, _)| t.clone()).collect();
                discard(&placed).await;
                discard(&pending).await;
                return self.missing_or(name, e.into()).await;
            }
        }

        debug!(cache = name, entries = entries.len(), "Wrote cache entries");
        Ok(true)
    }

    async fn delete_entry(&self, name: &str, key: &str) -> Result<bool, StoreError> {
        let (meta_path, body_path) = self.entry_paths(name, key);
        let existed = remove_if_exists(&meta_path).await?;
        remove_if_exists(&body_path).await?;
        Ok(existed)
    }

    async fn entry_keys(&self, name: &str) -> Result<Vec<String>, StoreError> {
        let mut dir = match fs::read_dir(self.namespace_dir(name)).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(file) = dir.next_entry().await? {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some(META_EXT)
                || !file.file_type().await?.is_file()
            {
                continue;
            }
            if let Some(entry) = Self::read_meta(&path).await? {
                keys.push(entry.url);
            }
        }
        keys.sort();
        Ok(keys)
    }
}
