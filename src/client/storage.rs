use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;

use super::ClientCacheError;
use super::entry::CachedResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageEstimate {
    pub usage: u64,
    pub quota: u64,
}

impl StorageEstimate {
    /// Usage as a fraction of quota; a zero quota counts as full.
    pub fn ratio(&self) -> f64 {
        if self.quota == 0 {
            return 1.0;
        }
        self.usage as f64 / self.quota as f64
    }
}

/// Response storage partitioned by cache class name.
#[async_trait]
pub trait ResponseStorage: Send + Sync {
    async fn get(&self, class: &str, key: &str) -> Result<Option<CachedResponse>, ClientCacheError>;
    /// Fails with [`ClientCacheError::QuotaExceeded`] when the write does not fit.
    async fn put(
        &self,
        class: &str,
        key: &str,
        response: CachedResponse,
    ) -> Result<(), ClientCacheError>;
    async fn delete(&self, class: &str, key: &str) -> Result<bool, ClientCacheError>;
    /// Keys in `class` with their cached-at stamps.
    async fn entries(&self, class: &str) -> Result<Vec<(String, Option<u64>)>, ClientCacheError>;
    async fn classes(&self) -> Result<Vec<String>, ClientCacheError>;
    async fn delete_class(&self, class: &str) -> Result<bool, ClientCacheError>;
    async fn estimate(&self) -> Result<StorageEstimate, ClientCacheError>;
}

/// In-memory storage with a hard byte quota.
pub struct MemoryResponseStorage {
    classes: DashMap<String, HashMap<String, CachedResponse>>,
    quota: u64,
}

impl MemoryResponseStorage {
    pub fn new(quota: u64) -> Self {
        Self {
            classes: DashMap::new(),
            quota,
        }
    }

    fn usage(&self) -> u64 {
        self.classes
            .iter()
            .map(|class| class.values().map(CachedResponse::size_bytes).sum::<u64>())
            .sum()
    }

    pub fn len(&self, class: &str) -> usize {
        self.classes.get(class).map_or(0, |entries| entries.len())
    }
}

#[async_trait]
impl ResponseStorage for MemoryResponseStorage {
    async fn get(&self, class: &str, key: &str) -> Result<Option<CachedResponse>, ClientCacheError> {
        Ok(self
            .classes
            .get(class)
            .and_then(|entries| entries.get(key).cloned()))
    }

    async fn put(
        &self,
        class: &str,
        key: &str,
        response: CachedResponse,
    ) -> Result<(), ClientCacheError> {
        let replaced = self
            .classes
            .get(class)
            .and_then(|entries| entries.get(key).map(CachedResponse::size_bytes))
            .unwrap_or(0);
        let needed = response.size_bytes();
        let available = self.quota.saturating_sub(self.usage().saturating_sub(replaced));
        if needed > available {
            return Err(ClientCacheError::QuotaExceeded { needed, available });
        }
        self.classes
            .entry(class.to_string())
            .or_default()
            .insert(key.to_string(), response);
        Ok(())
    }

    async fn delete(&self, class: &str, key: &str) -> Result<bool, ClientCacheError> {
        Ok(self
            .classes
            .get_mut(class)
            .is_some_and(|mut entries| entries.remove(key).is_some()))
    }

    async fn entries(&self, class: &str) -> Result<Vec<(String, Option<u64>)>, ClientCacheError> {
        Ok(self
            .classes
            .get(class)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(key, response)| (key.clone(), response.cached_at()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn classes(&self) -> Result<Vec<String>, ClientCacheError> {
        Ok(self.classes.iter().map(|class| class.key().clone()).collect())
    }

    async fn delete_class(&self, class: &str) -> Result<bool, ClientCacheError> {
        Ok(self.classes.remove(class).is_some())
    }

    async fn estimate(&self) -> Result<StorageEstimate, ClientCacheError> {
        Ok(StorageEstimate {
            usage: self.usage(),
            quota: self.quota,
        })
    }
}
