use std::sync::Arc;

use metrics::counter;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::ClientCacheError;
use super::config::{CacheClassConfig, CacheStrategy, ClientCacheConfig};
use super::entry::{CachedResponse, FetchRequest};
use super::fetcher::{Fetcher, HttpFetcher};
use super::storage::{MemoryResponseStorage, ResponseStorage, StorageEstimate};
use crate::config::ClientSettings;

const METRIC_CLIENT_EVICT: &str = "devpulse_client_cache_evict_total";
const METRIC_CLIENT_WRITE_SKIPPED: &str = "devpulse_client_cache_write_skipped_total";

/// Wall clock in milliseconds since the epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64
    }
}

/// Routes requests through the strategy of their cache class.
#[derive(Clone)]
pub struct ResponseCacheManager {
    config: Arc<ClientCacheConfig>,
    storage: Arc<dyn ResponseStorage>,
    fetcher: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
}

impl ResponseCacheManager {
    pub fn new(
        config: ClientCacheConfig,
        storage: Arc<dyn ResponseStorage>,
        fetcher: Arc<dyn Fetcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            storage,
            fetcher,
            clock,
        }
    }

    /// Manager over in-process storage capped at the configured quota.
    pub fn in_memory(config: ClientCacheConfig) -> Self {
        let storage = Arc::new(MemoryResponseStorage::new(config.quota_bytes));
        Self::new(
            config,
            storage,
            Arc::new(HttpFetcher::default()),
            Arc::new(SystemClock),
        )
    }

    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self::in_memory(ClientCacheConfig::from(settings))
    }

    pub fn config(&self) -> &ClientCacheConfig {
        &self.config
    }

    pub async fn estimate(&self) -> Result<StorageEstimate, ClientCacheError> {
        self.storage.estimate().await
    }

    /// Answer `request` using exactly one strategy.
    ///
    /// Requests that are not `GET` or match no class go straight to the network.
    pub async fn handle(&self, request: FetchRequest) -> Result<CachedResponse, ClientCacheError> {
        if !request.is_cacheable() {
            return self.fetcher.fetch(&request).await;
        }
        let Some(class) = self.config.class_for(&request) else {
            return self.fetcher.fetch(&request).await;
        };

        debug!(class = %class.name, strategy = ?class.strategy, url = %request.url, "Handling request");
        match class.strategy {
            CacheStrategy::CacheFirst => self.cache_first(class, &request).await,
            CacheStrategy::NetworkFirst => self.network_first(class, &request).await,
            CacheStrategy::StaleWhileRevalidate => {
                self.stale_while_revalidate(class, request).await
            }
            CacheStrategy::NetworkOnly => self.fetcher.fetch(&request).await,
            CacheStrategy::CacheOnly => self.cache_only(class, &request).await,
        }
    }

    async fn cache_first(
        &self,
        class: &CacheClassConfig,
        request: &FetchRequest,
    ) -> Result<CachedResponse, ClientCacheError> {
        let cached = self.lookup(class, request).await;
        if let Some(response) = &cached
            && !self.is_expired(class, response)
        {
            return Ok(response.clone());
        }

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                self.store(class, request, &response).await;
                Ok(response)
            }
            Err(err) => match cached {
                Some(stale) => {
                    warn!(class = %class.name, url = %request.url, error = %err, "Network failed; serving stale entry");
                    Ok(stale)
                }
                None => Err(err),
            },
        }
    }

    async fn network_first(
        &self,
        class: &CacheClassConfig,
        request: &FetchRequest,
    ) -> Result<CachedResponse, ClientCacheError> {
        let fetched = match class.network_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.fetcher.fetch(request)).await {
                Ok(result) => result,
                Err(_) => Err(ClientCacheError::Timeout {
                    url: request.url.to_string(),
                    timeout_ms: limit.as_millis() as u64,
                }),
            },
            None => self.fetcher.fetch(request).await,
        };

        match fetched {
            Ok(response) => {
                self.store(class, request, &response).await;
                Ok(response)
            }
            Err(err) => match self.lookup(class, request).await {
                Some(cached) => {
                    info!(class = %class.name, url = %request.url, error = %err, "Network failed; serving cached entry");
                    Ok(cached)
                }
                None => Err(err),
            },
        }
    }

    async fn stale_while_revalidate(
        &self,
        class: &CacheClassConfig,
        request: FetchRequest,
    ) -> Result<CachedResponse, ClientCacheError> {
        match self.lookup(class, &request).await {
            Some(cached) => {
                self.spawn_revalidation(class.cache_name(), request);
                Ok(cached)
            }
            None => {
                let response = self.fetcher.fetch(&request).await?;
                self.store(class, &request, &response).await;
                Ok(response)
            }
        }
    }

    /// Refresh in a detached task; the caller never observes its outcome.
    fn spawn_revalidation(&self, class_name: String, request: FetchRequest) {
        let manager = self.clone();
        tokio::spawn(async move {
            let Some(class) = manager.config.class(&class_name) else {
                return;
            };
            match manager.fetcher.fetch(&request).await {
                Ok(response) => manager.store(class, &request, &response).await,
                Err(err) => {
                    warn!(class = %class_name, url = %request.url, error = %err, "Background revalidation failed");
                }
            }
        });
    }

    async fn cache_only(
        &self,
        class: &CacheClassConfig,
        request: &FetchRequest,
    ) -> Result<CachedResponse, ClientCacheError> {
        match self.lookup(class, request).await {
            Some(cached) if !self.is_expired(class, &cached) => Ok(cached),
            _ => Err(ClientCacheError::CacheMiss {
                class: class.cache_name(),
                url: request.url.to_string(),
            }),
        }
    }

    fn is_expired(&self, class: &CacheClassConfig, response: &CachedResponse) -> bool {
        response.is_expired(self.clock.now_ms(), class.max_age.as_secs())
    }

    async fn lookup(&self, class: &CacheClassConfig, request: &FetchRequest) -> Option<CachedResponse> {
        match self.storage.get(&class.cache_name(), &request.cache_key()).await {
            Ok(found) => found,
            Err(err) => {
                warn!(class = %class.name, url = %request.url, error = %err, "Cache read failed");
                None
            }
        }
    }

    /// Store a successful response, then trim the class to `max_entries`.
    ///
    /// Quota pressure and storage errors only mean the response is not cached.
    async fn store(&self, class: &CacheClassConfig, request: &FetchRequest, response: &CachedResponse) {
        if !response.is_success() {
            return;
        }

        let stamped = response.stamped(self.clock.now_ms());
        match self.storage.estimate().await {
            Ok(estimate) => {
                let projected = StorageEstimate {
                    usage: estimate.usage + stamped.size_bytes(),
                    quota: estimate.quota,
                };
                if projected.ratio() > self.config.quota_threshold {
                    counter!(METRIC_CLIENT_WRITE_SKIPPED, "reason" => "threshold").increment(1);
                    warn!(
                        class = %class.name,
                        usage = estimate.usage,
                        quota = estimate.quota,
                        "Storage near quota; response not cached"
                    );
                    return;
                }
            }
            Err(err) => {
                warn!(error = %err, "Storage estimate unavailable");
            }
        }

        if let Err(err) = self
            .storage
            .put(&class.cache_name(), &request.cache_key(), stamped)
            .await
        {
            let reason = if err.is_quota() { "quota" } else { "error" };
            counter!(METRIC_CLIENT_WRITE_SKIPPED, "reason" => reason).increment(1);
            warn!(class = %class.name, url = %request.url, error = %err, "Response not cached");
            return;
        }

        self.evict(class).await;
    }

    async fn evict(&self, class: &CacheClassConfig) {
        let cache_name = class.cache_name();
        let mut entries = match self.storage.entries(&cache_name).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(class = %class.name, error = %err, "Failed to list entries for eviction");
                return;
            }
        };
        if entries.len() <= class.max_entries {
            return;
        }

        // Unstamped entries sort first; equal stamps fall back to the key.
        entries.sort_by(|(key_a, at_a), (key_b, at_b)| {
            at_a.unwrap_or(0)
                .cmp(&at_b.unwrap_or(0))
                .then_with(|| key_a.cmp(key_b))
        });
        let excess = entries.len() - class.max_entries;
        let mut evicted = 0u64;
        for (key, _) in entries.into_iter().take(excess) {
            match self.storage.delete(&cache_name, &key).await {
                Ok(true) => evicted += 1,
                Ok(false) => {}
                Err(err) => warn!(class = %class.name, key = %key, error = %err, "Eviction failed"),
            }
        }
        counter!(METRIC_CLIENT_EVICT, "class" => cache_name).increment(evicted);
        debug!(class = %class.name, evicted, "Evicted oldest entries");
    }

    /// Delete every stored partition that no configured class maps to.
    ///
    /// Run on deploy: a class version bump purges the previous partition.
    pub async fn activate(&self) -> Result<Vec<String>, ClientCacheError> {
        let mut purged = Vec::new();
        for name in self.storage.classes().await? {
            if self.config.class(&name).is_none() && self.storage.delete_class(&name).await? {
                purged.push(name);
            }
        }
        if !purged.is_empty() {
            info!(purged = ?purged, "Purged outdated cache classes");
        }
        Ok(purged)
    }

    pub async fn clear_all(&self) -> Result<usize, ClientCacheError> {
        let mut cleared = 0;
        for name in self.storage.classes().await? {
            if self.storage.delete_class(&name).await? {
                cleared += 1;
            }
        }
        Ok(cleared)
    }
}
