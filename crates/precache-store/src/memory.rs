//! In-memory cache backend.

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::sync::RwLock;

use crate::{CacheBackend, CacheEntry, StoreError};

#[derive(Debug, Default)]
struct State {
    /// Namespace names in creation order.
    order: Vec<String>,
    caches: HashMap<String, HashMap<String, CacheEntry>>,
}

impl State {
    fn ensure(&mut self, name: &str) -> &mut HashMap<String, CacheEntry> {
        if !self.caches.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.caches.entry(name.to_string()).or_default()
    }
}

/// Backend that keeps everything in process memory.
///
/// `names()` reports namespaces in creation order.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: RwLock<State>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn open(&self, name: &str) -> Result<(), StoreError> {
        self.state.write().await.ensure(name);
        Ok(())
    }

    async fn has(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.state.read().await.caches.contains_key(name))
    }

    async fn names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.state.read().await.order.clone())
    }

    async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let existed = state.caches.remove(name).is_some();
        state.order.retain(|n| n != name);
        Ok(existed)
    }

    async fn get(&self, name: &str, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let state = self.state.read().await;
        Ok(state.caches.get(name).and_then(|c| c.get(key)).cloned())
    }

    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let Some(cache) = state.caches.get_mut(name) else {
            return Ok(false);
        };
        for entry in entries {
            cache.insert(entry.url.clone(), entry);
        }
        Ok(true)
    }

    async fn delete_entry(&self, name: &str, key: &str) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        Ok(state
            .caches
            .get_mut(name)
            .map(|c| c.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn entry_keys(&self, name: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.read().await;
        let mut keys: Vec<String> = state
            .caches
            .get(name)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }
}
