//! Cache engine configuration.

use std::time::Duration;

use super::keys::Category;

const DEFAULT_NAMESPACE: &str = "devpulse";
const DEFAULT_SCAN_BATCH_SIZE: usize = 100;
const DEFAULT_AUTO_CONSUME_INTERVAL_MS: u64 = 5000;
const DEFAULT_CONSUME_BATCH_LIMIT: usize = 100;
const DEFAULT_EVENT_QUEUE_LIMIT: usize = 10_000;

/// Expiry applied when a caller stores a value without an explicit TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub user: u64,
    pub session: u64,
    pub dashboard: u64,
    pub github: u64,
    pub slack: u64,
    pub ai: u64,
    pub api: u64,
    pub preload: u64,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            user: 3600,
            session: 1800,
            dashboard: 300,
            github: 600,
            slack: 300,
            ai: 86_400,
            api: 300,
            preload: 900,
        }
    }
}

impl TtlPolicy {
    /// Default TTL in seconds for `category`; `None` for internal categories.
    pub fn for_category(&self, category: Category) -> Option<u64> {
        match category {
            Category::User => Some(self.user),
            Category::Session => Some(self.session),
            Category::Dashboard => Some(self.dashboard),
            Category::Github => Some(self.github),
            Category::Slack => Some(self.slack),
            Category::Ai => Some(self.ai),
            Category::Api => Some(self.api),
            Category::Preload => Some(self.preload),
            Category::Tag | Category::Health => None,
        }
    }
}

impl From<&crate::config::TtlSettings> for TtlPolicy {
    fn from(settings: &crate::config::TtlSettings) -> Self {
        let secs = Duration::as_secs;
        Self {
            user: secs(&settings.user),
            session: secs(&settings.session),
            dashboard: secs(&settings.dashboard),
            github: secs(&settings.github),
            slack: secs(&settings.slack),
            ai: secs(&settings.ai),
            api: secs(&settings.api),
            preload: secs(&settings.preload),
        }
    }
}

/// Cache engine configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// First segment of every key.
    pub namespace: String,
    /// Keys examined per `SCAN` step during pattern deletion.
    pub scan_batch_size: usize,
    /// Auto-consume interval (ms) for queued domain events; `0` disables it.
    pub auto_consume_interval_ms: u64,
    /// Maximum events per consumption batch.
    pub consume_batch_limit: usize,
    /// Queue capacity; the oldest event is dropped beyond it.
    pub event_queue_limit: usize,
    pub ttl: TtlPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            scan_batch_size: DEFAULT_SCAN_BATCH_SIZE,
            auto_consume_interval_ms: DEFAULT_AUTO_CONSUME_INTERVAL_MS,
            consume_batch_limit: DEFAULT_CONSUME_BATCH_LIMIT,
            event_queue_limit: DEFAULT_EVENT_QUEUE_LIMIT,
            ttl: TtlPolicy::default(),
        }
    }
}

impl From<&crate::config::Settings> for CacheConfig {
    fn from(settings: &crate::config::Settings) -> Self {
        Self {
            namespace: settings.store.namespace.clone(),
            scan_batch_size: settings.store.scan_batch_size.get(),
            auto_consume_interval_ms: settings.cache.auto_consume_interval_ms,
            consume_batch_limit: settings.cache.consume_batch_limit,
            event_queue_limit: settings.cache.event_queue_limit,
            ttl: TtlPolicy::from(&settings.store.ttl),
        }
    }
}

impl CacheConfig {
    /// Background consumption interval, if enabled.
    pub fn auto_consume_interval(&self) -> Option<Duration> {
        (self.auto_consume_interval_ms > 0)
            .then(|| Duration::from_millis(self.auto_consume_interval_ms))
    }

    /// Scan batch size, clamped to at least one key.
    pub fn scan_batch_size(&self) -> usize {
        self.scan_batch_size.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.namespace, "devpulse");
        assert_eq!(config.scan_batch_size, 100);
        assert_eq!(config.auto_consume_interval_ms, 5000);
        assert_eq!(config.consume_batch_limit, 100);
        assert_eq!(config.event_queue_limit, 10_000);
    }

    #[test]
    fn zero_interval_disables_auto_consume() {
        let config = CacheConfig {
            auto_consume_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.auto_consume_interval().is_none());
    }

    #[test]
    fn scan_batch_clamps_to_one() {
        let config = CacheConfig {
            scan_batch_size: 0,
            ..Default::default()
        };
        assert_eq!(config.scan_batch_size(), 1);
    }

    #[test]
    fn internal_categories_have_no_default_ttl() {
        let policy = TtlPolicy::default();
        assert_eq!(policy.for_category(Category::Tag), None);
        assert_eq!(policy.for_category(Category::Health), None);
        assert_eq!(policy.for_category(Category::Ai), Some(86_400));
    }
}
