//! Store backends.
//!
//! The keyed store talks to a backend through [`StoreBackend`], which mirrors
//! the subset of Redis commands the cache needs. [`MemoryBackend`] implements
//! the same semantics in process for single-node deployments and tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

use super::glob;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::backend";

/// `TTL` reply for an absent key.
pub const TTL_ABSENT: i64 = -2;
/// `TTL` reply for a key without expiry.
pub const TTL_PERSISTENT: i64 = -1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("store operation `{op}` timed out after {timeout_ms}ms")]
    Timeout { op: &'static str, timeout_ms: u64 },
    #[error("key `{0}` holds a value of the wrong type")]
    WrongType(String),
    #[error("failed to serialize value for `{key}`: {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Minimal command set of a remote key/value store.
///
/// TTLs are whole seconds. `ttl` follows Redis: [`TTL_ABSENT`] for a missing
/// key, [`TTL_PERSISTENT`] for a key without expiry.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn ping(&self) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), StoreError>;

    /// Write only when the key is absent. Returns whether the write happened.
    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl_secs: Option<u64>,
    ) -> Result<bool, StoreError>;

    /// Delete `keys`, returning how many existed.
    async fn del(&self, keys: &[String]) -> Result<u64, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn ttl(&self, key: &str) -> Result<i64, StoreError>;

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, StoreError>;

    async fn persist(&self, key: &str) -> Result<bool, StoreError>;

    /// One `SCAN` step. A returned cursor of `0` ends the iteration.
    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError>;

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, StoreError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Remove `members`, returning how many were present. An emptied set is deleted.
    async fn srem(&self, key: &str, members: &[String]) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone)]
enum SlotValue {
    String(String),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: SlotValue,
    expires_at: Option<Instant>,
    seq: u64,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<String, Slot>,
    /// Insertion order, used as a stable scan cursor.
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl MemoryState {
    /// Live slot for `key`, purging it first when expired.
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Slot> {
        if self.entries.get(key).is_some_and(|slot| slot.is_expired(now)) {
            self.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(slot) => {
                self.order.remove(&slot.seq);
                true
            }
            None => false,
        }
    }

    fn insert(&mut self, key: &str, value: SlotValue, expires_at: Option<Instant>) {
        if let Some(slot) = self.entries.get_mut(key) {
            slot.value = value;
            slot.expires_at = expires_at;
            return;
        }
        self.next_seq += 1;
        let seq = self.next_seq;
        self.order.insert(seq, key.to_string());
        self.entries.insert(
            key.to_string(),
            Slot {
                value,
                expires_at,
                seq,
            },
        );
    }
}

fn deadline(now: Instant, ttl_secs: Option<u64>) -> Option<Instant> {
    ttl_secs.map(|secs| now + Duration::from_secs(secs))
}

/// In-process backend with Redis expiry and scan semantics.
///
/// Expiry follows the tokio clock, so tests can drive it with a paused
/// runtime.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        mutex_lock(&self.state, SOURCE, "len")
            .entries
            .values()
            .filter(|slot| !slot.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut state = mutex_lock(&self.state, SOURCE, "get");
        match state.live(key, Instant::now()) {
            Some(Slot {
                value: SlotValue::String(value),
                ..
            }) => Ok(Some(value.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut state = mutex_lock(&self.state, SOURCE, "set");
        state.insert(key, SlotValue::String(value.to_string()), deadline(now, ttl_secs));
        Ok(())
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl_secs: Option<u64>,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut state = mutex_lock(&self.state, SOURCE, "set_nx");
        if state.live(key, now).is_some() {
            return Ok(false);
        }
        state.insert(key, SlotValue::String(value.to_string()), deadline(now, ttl_secs));
        Ok(true)
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut state = mutex_lock(&self.state, SOURCE, "del");
        let mut removed = 0;
        for key in keys {
            if state.live(key, now).is_some() && state.remove(key) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut state = mutex_lock(&self.state, SOURCE, "exists");
        Ok(state.live(key, Instant::now()).is_some())
    }

    async fn ttl(&self, key: &str) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut state = mutex_lock(&self.state, SOURCE, "ttl");
        let reply = match state.live(key, now) {
            None => TTL_ABSENT,
            Some(Slot {
                expires_at: None, ..
            }) => TTL_PERSISTENT,
            Some(Slot {
                expires_at: Some(at),
                ..
            }) => {
                // Redis rounds the remaining milliseconds to the nearest second.
                let remaining_ms = at.saturating_duration_since(now).as_millis() as i64;
                (remaining_ms + 500) / 1000
            }
        };
        Ok(reply)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut state = mutex_lock(&self.state, SOURCE, "expire");
        if state.live(key, now).is_none() {
            return Ok(false);
        }
        if ttl_secs == 0 {
            state.remove(key);
            return Ok(true);
        }
        if let Some(slot) = state.entries.get_mut(key) {
            slot.expires_at = deadline(now, Some(ttl_secs));
        }
        Ok(true)
    }

    async fn persist(&self, key: &str) -> Result<bool, StoreError> {
        let mut state = mutex_lock(&self.state, SOURCE, "persist");
        match state.live(key, Instant::now()) {
            Some(slot) if slot.expires_at.is_some() => {
                slot.expires_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        let now = Instant::now();
        let mut state = mutex_lock(&self.state, SOURCE, "scan");
        let examined: Vec<(u64, String)> = state
            .order
            .range(cursor.saturating_add(1)..)
            .take(count.max(1))
            .map(|(seq, key)| (*seq, key.clone()))
            .collect();

        let mut keys = Vec::new();
        for (_, key) in &examined {
            if state.live(key, now).is_some() && glob::matches(pattern, key) {
                keys.push(key.clone());
            }
        }

        let next = match examined.last() {
            Some((seq, _)) if state.order.range(seq + 1..).next().is_some() => *seq,
            _ => 0,
        };
        Ok((next, keys))
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut state = mutex_lock(&self.state, SOURCE, "sadd");
        let (mut set, expires_at) = match state.live(key, now) {
            Some(Slot {
                value: SlotValue::Set(set),
                expires_at,
                ..
            }) => (std::mem::take(set), *expires_at),
            Some(_) => return Err(StoreError::WrongType(key.to_string())),
            None => (BTreeSet::new(), None),
        };
        let added = members
            .iter()
            .filter(|member| set.insert((*member).clone()))
            .count() as u64;
        state.insert(key, SlotValue::Set(set), expires_at);
        Ok(added)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut state = mutex_lock(&self.state, SOURCE, "smembers");
        match state.live(key, Instant::now()) {
            Some(Slot {
                value: SlotValue::Set(set),
                ..
            }) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        let mut state = mutex_lock(&self.state, SOURCE, "srem");
        let (removed, emptied) = match state.live(key, Instant::now()) {
            Some(Slot {
                value: SlotValue::Set(set),
                ..
            }) => {
                let removed = members.iter().filter(|member| set.remove(*member)).count() as u64;
                (removed, set.is_empty())
            }
            Some(_) => return Err(StoreError::WrongType(key.to_string())),
            None => return Ok(0),
        };
        if emptied {
            state.remove(key);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn keys_expire_on_the_tokio_clock() {
        let backend = MemoryBackend::new();
        backend.set("k", "v", Some(60)).await.expect("set");
        assert_eq!(backend.ttl("k").await.expect("ttl"), 60);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(backend.ttl("k").await.expect("ttl"), 50);

        tokio::time::advance(Duration::from_secs(50)).await;
        assert_eq!(backend.get("k").await.expect("get"), None);
        assert_eq!(backend.ttl("k").await.expect("ttl"), TTL_ABSENT);
    }

    #[tokio::test]
    async fn plain_set_clears_previous_expiry() {
        let backend = MemoryBackend::new();
        backend.set("k", "v1", Some(60)).await.expect("set");
        backend.set("k", "v2", None).await.expect("set");
        assert_eq!(backend.ttl("k").await.expect("ttl"), TTL_PERSISTENT);
    }

    #[tokio::test]
    async fn set_nx_keeps_existing_value() {
        let backend = MemoryBackend::new();
        assert!(backend.set_nx("k", "first", None).await.expect("set_nx"));
        assert!(!backend.set_nx("k", "second", None).await.expect("set_nx"));
        assert_eq!(
            backend.get("k").await.expect("get").as_deref(),
            Some("first")
        );
    }

    #[tokio::test]
    async fn scan_visits_every_key_once_across_batches() {
        let backend = MemoryBackend::new();
        for i in 0..25 {
            backend
                .set(&format!("app:item:{i}"), "v", None)
                .await
                .expect("set");
        }
        backend.set("other:item", "v", None).await.expect("set");

        let mut cursor = 0;
        let mut seen = Vec::new();
        loop {
            let (next, keys) = backend.scan(cursor, "app:*", 10).await.expect("scan");
            seen.extend(keys);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 25);
    }

    #[tokio::test]
    async fn scan_survives_deletes_between_steps() {
        let backend = MemoryBackend::new();
        for i in 0..6 {
            backend.set(&format!("k{i}"), "v", None).await.expect("set");
        }
        let (cursor, first) = backend.scan(0, "*", 3).await.expect("scan");
        backend.del(&first).await.expect("del");
        let (next, second) = backend.scan(cursor, "*", 3).await.expect("scan");
        assert_eq!(second, vec!["k3", "k4", "k5"]);
        assert_eq!(next, 0);
    }

    #[tokio::test]
    async fn set_commands_reject_string_keys() {
        let backend = MemoryBackend::new();
        backend.set("k", "v", None).await.expect("set");
        assert!(matches!(
            backend.sadd("k", &["m".to_string()]).await,
            Err(StoreError::WrongType(_))
        ));
    }

    #[tokio::test]
    async fn expire_zero_deletes() {
        let backend = MemoryBackend::new();
        backend.set("k", "v", None).await.expect("set");
        assert!(backend.expire("k", 0).await.expect("expire"));
        assert!(!backend.exists("k").await.expect("exists"));
    }
}
