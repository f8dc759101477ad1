//! Client-side response cache.
//!
//! Every outgoing request is matched to a versioned cache class, and the
//! class strategy decides whether the response comes from the cache, the
//! network, or both. Entries expire by age, classes are capped by entry
//! count, and writes back off when storage nears its quota.

mod config;
mod entry;
mod fetcher;
mod manager;
mod storage;

use thiserror::Error;

pub use config::{CacheClassConfig, CacheStrategy, ClientCacheConfig, RequestMatcher};
pub use entry::{CACHED_AT_HEADER, CachedResponse, FetchRequest};
pub use fetcher::{Fetcher, HttpFetcher};
pub use manager::{Clock, ResponseCacheManager, SystemClock};
pub use storage::{MemoryResponseStorage, ResponseStorage, StorageEstimate};

#[derive(Debug, Error)]
pub enum ClientCacheError {
    #[error("network request to `{url}` failed: {message}")]
    Network { url: String, message: String },
    #[error("network request to `{url}` timed out after {timeout_ms} ms")]
    Timeout { url: String, timeout_ms: u64 },
    #[error("no cached response for `{url}` in `{class}`")]
    CacheMiss { class: String, url: String },
    #[error("storage quota exceeded: {needed} bytes needed, {available} available")]
    QuotaExceeded { needed: u64, available: u64 },
}

impl ClientCacheError {
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
}
