//! Keyed store adapter.
//!
//! JSON values with per-key expiry, tag sets and pattern deletion on top of
//! a [`StoreBackend`]. Reads and writes never surface store failures: a
//! failed read is a miss and a failed write returns `false`. Deletions
//! return `Result` so invalidation can report partial failure.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::backend::{StoreBackend, StoreError, TTL_ABSENT, TTL_PERSISTENT};
use super::config::CacheConfig;
use super::keys::{KeySpace, Subtree};
use super::stats::CacheStats;

const SOURCE: &str = "cache::store";

#[derive(Clone)]
pub struct KeyedStore {
    backend: Arc<dyn StoreBackend>,
    keys: KeySpace,
    stats: Arc<CacheStats>,
    scan_batch_size: usize,
}

impl KeyedStore {
    pub fn new(backend: Arc<dyn StoreBackend>, keys: KeySpace, config: &CacheConfig) -> Self {
        Self {
            backend,
            keys,
            stats: Arc::new(CacheStats::new()),
            scan_batch_size: config.scan_batch_size(),
        }
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn stats(&self) -> &Arc<CacheStats> {
        &self.stats
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Raw backend, bypassing degradation and statistics.
    pub(crate) fn backend(&self) -> &Arc<dyn StoreBackend> {
        &self.backend
    }

    fn degraded(&self, op: &'static str, key: &str, err: &StoreError) {
        self.stats.record_error(op);
        warn!(
            target_module = SOURCE,
            op,
            key,
            error = %err,
            "Cache store operation failed; degrading"
        );
    }

    /// Read and deserialize `key`. Absent, unreadable and undecodable values are misses.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.backend.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.stats.record_miss();
                return None;
            }
            Err(err) => {
                self.degraded("get", key, &err);
                self.stats.record_miss();
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => {
                self.stats.record_hit();
                Some(value)
            }
            Err(err) => {
                warn!(
                    target_module = SOURCE,
                    key,
                    error = %err,
                    "Cached value failed to deserialize; treating as miss"
                );
                self.stats.record_miss();
                None
            }
        }
    }

    pub async fn get_value(&self, key: &str) -> Option<Value> {
        self.get::<Value>(key).await
    }

    /// Store `value` under `key`.
    ///
    /// A `ttl` of `None` or `Some(0)` stores without expiry. Every tag gets
    /// `key` added to its index set, and tags the previous value carried but
    /// this one does not stop listing it.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<u64>,
        tags: &[String],
    ) -> bool {
        let ttl = ttl.filter(|secs| *secs > 0);
        let raw = match encode(key, value) {
            Ok(raw) => raw,
            Err(err) => {
                self.degraded("set", key, &err);
                return false;
            }
        };

        if let Err(err) = self.backend.set(key, &raw, ttl).await {
            self.degraded("set", key, &err);
            return false;
        }
        self.stats.record_write();

        if let Err(err) = self.retag(key, tags, ttl).await {
            self.degraded("set.tag", key, &err);
            return false;
        }
        true
    }

    /// Store `value` only when `key` is absent.
    pub async fn set_if_absent<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<u64>,
    ) -> Result<bool, StoreError> {
        let raw = encode(key, value)?;
        let written = self
            .backend
            .set_nx(key, &raw, ttl.filter(|secs| *secs > 0))
            .await?;
        if written {
            self.stats.record_write();
            self.retag(key, &[], ttl).await?;
        }
        Ok(written)
    }

    /// Make the tag indexes list `key` under exactly `tags`.
    async fn retag(&self, key: &str, tags: &[String], ttl: Option<u64>) -> Result<(), StoreError> {
        let owner = self.keys.tags_of(key);
        let previous = self.backend.smembers(&owner).await?;
        let member = [key.to_string()];
        for tag in previous.iter().filter(|tag| !tags.contains(tag)) {
            self.backend.srem(&self.keys.tag(tag), &member).await?;
        }
        if !previous.is_empty() {
            self.backend.del(std::slice::from_ref(&owner)).await?;
        }
        if tags.is_empty() {
            return Ok(());
        }

        self.backend.sadd(&owner, tags).await?;
        if let Some(secs) = ttl.filter(|secs| *secs > 0) {
            self.backend.expire(&owner, secs).await?;
        }
        for tag in tags {
            self.register_tag(tag, key, ttl).await?;
        }
        Ok(())
    }

    /// Add `key` to the index of `tag` and stretch the index TTL to cover it.
    async fn register_tag(&self, tag: &str, key: &str, ttl: Option<u64>) -> Result<(), StoreError> {
        let tag_key = self.keys.tag(tag);
        let existed = self.backend.exists(&tag_key).await?;
        self.backend.sadd(&tag_key, &[key.to_string()]).await?;

        match ttl {
            None => {
                self.backend.persist(&tag_key).await?;
            }
            Some(secs) if !existed => {
                self.backend.expire(&tag_key, secs).await?;
            }
            Some(secs) => {
                let current = self.backend.ttl(&tag_key).await?;
                if current != TTL_PERSISTENT && current < secs as i64 {
                    self.backend.expire(&tag_key, secs).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> bool {
        match self.backend.exists(key).await {
            Ok(exists) => exists,
            Err(err) => {
                self.degraded("exists", key, &err);
                false
            }
        }
    }

    /// Seconds remaining, `-1` without expiry, `0` when absent.
    pub async fn ttl(&self, key: &str) -> i64 {
        match self.backend.ttl(key).await {
            Ok(TTL_ABSENT) => 0,
            Ok(secs) => secs,
            Err(err) => {
                self.degraded("ttl", key, &err);
                0
            }
        }
    }

    pub async fn del(&self, key: &str) -> bool {
        match self.delete_keys(&[key.to_string()]).await {
            Ok(removed) => removed > 0,
            Err(err) => {
                self.degraded("del", key, &err);
                false
            }
        }
    }

    pub async fn expire(&self, key: &str, ttl_secs: u64) -> bool {
        match self.backend.expire(key, ttl_secs).await {
            Ok(applied) => applied,
            Err(err) => {
                self.degraded("expire", key, &err);
                false
            }
        }
    }

    /// Delete exact keys in batches, returning how many existed.
    pub async fn delete_keys(&self, keys: &[String]) -> Result<u64, StoreError> {
        let mut removed = 0;
        for chunk in keys.chunks(self.scan_batch_size) {
            removed += self.backend.del(chunk).await?;
        }
        self.stats.record_invalidated(removed);
        Ok(removed)
    }

    /// Delete every key matching `pattern`.
    ///
    /// Enumerates with cursor-based `SCAN` and deletes each batch with one
    /// `DEL`, so no single command covers the whole match set.
    pub async fn delete_by_pattern(&self, pattern: &str) -> Result<u64, StoreError> {
        let mut cursor = 0;
        let mut removed = 0;
        let mut batches = 0usize;
        loop {
            let (next, keys) = self
                .backend
                .scan(cursor, pattern, self.scan_batch_size)
                .await?;
            if !keys.is_empty() {
                removed += self.backend.del(&keys).await?;
                batches += 1;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        self.stats.record_invalidated(removed);
        debug!(target_module = SOURCE, pattern, removed, batches, "Pattern deletion complete");
        Ok(removed)
    }

    /// Delete every entry still carrying `tag` plus the index itself.
    ///
    /// Members whose current tags no longer include `tag` are left alone.
    /// Only deleted members are counted.
    pub async fn invalidate_by_tag(&self, tag: &str) -> Result<u64, StoreError> {
        let tag_key = self.keys.tag(tag);
        let mut tagged = Vec::new();
        for member in self.backend.smembers(&tag_key).await? {
            let current = self.backend.smembers(&self.keys.tags_of(&member)).await?;
            if current.iter().any(|held| held == tag) {
                tagged.push((member, current));
            }
        }

        let members: Vec<String> = tagged.iter().map(|(member, _)| member.clone()).collect();
        let removed = self.delete_keys(&members).await?;
        for (member, current) in &tagged {
            let listed = [member.clone()];
            for other in current.iter().filter(|held| *held != tag) {
                self.backend.srem(&self.keys.tag(other), &listed).await?;
            }
            self.backend.del(&[self.keys.tags_of(member)]).await?;
        }
        self.backend.del(&[tag_key]).await?;
        debug!(target_module = SOURCE, tag, removed, "Tag invalidation complete");
        Ok(removed)
    }

    /// Delete a subtree root and everything below it.
    pub async fn delete_subtree(&self, subtree: &Subtree) -> Result<u64, StoreError> {
        let root = self.delete_keys(std::slice::from_ref(&subtree.root)).await?;
        let below = self.delete_by_pattern(&subtree.pattern).await?;
        Ok(root + below)
    }

    /// Keys matching `pattern`, at most `limit` of them.
    pub async fn keys_matching(&self, pattern: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        let mut cursor = 0;
        let mut found = Vec::new();
        loop {
            let (next, keys) = self
                .backend
                .scan(cursor, pattern, self.scan_batch_size)
                .await?;
            found.extend(keys);
            if found.len() >= limit || next == 0 {
                break;
            }
            cursor = next;
        }
        found.truncate(limit);
        Ok(found)
    }

    /// Number of keys matching `pattern`.
    pub async fn count(&self, pattern: &str) -> Result<u64, StoreError> {
        let mut cursor = 0;
        let mut total = 0;
        loop {
            let (next, keys) = self
                .backend
                .scan(cursor, pattern, self.scan_batch_size)
                .await?;
            total += keys.len() as u64;
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(total)
    }

    /// Round-trip latency of one `PING`.
    pub async fn ping(&self) -> Result<Duration, StoreError> {
        let started = Instant::now();
        self.backend.ping().await?;
        Ok(started.elapsed())
    }
}

fn encode<T: Serialize + ?Sized>(key: &str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|source| StoreError::Serialize {
        key: key.to_string(),
        source,
    })
}
