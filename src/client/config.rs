use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::entry::FetchRequest;

const DEFAULT_QUOTA_BYTES: u64 = 50 * 1024 * 1024;
const DEFAULT_QUOTA_THRESHOLD: f64 = 0.9;

const DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
    CacheFirst,
    NetworkFirst,
    StaleWhileRevalidate,
    NetworkOnly,
    CacheOnly,
}

/// Selects the requests that belong to a cache class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestMatcher {
    /// Path starts with the prefix.
    PathPrefix(String),
    /// Path ends in one of the extensions (without the dot).
    Extensions(Vec<String>),
    Any,
}

impl RequestMatcher {
    pub fn matches(&self, request: &FetchRequest) -> bool {
        let path = request.url.path();
        match self {
            RequestMatcher::PathPrefix(prefix) => path.starts_with(prefix.as_str()),
            RequestMatcher::Extensions(extensions) => path
                .rsplit_once('.')
                .is_some_and(|(_, ext)| extensions.iter().any(|known| known.eq_ignore_ascii_case(ext))),
            RequestMatcher::Any => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheClassConfig {
    pub name: String,
    /// Bumping the version renames the storage partition, so activation purges the old one.
    pub version: u32,
    pub strategy: CacheStrategy,
    pub max_entries: usize,
    pub max_age: Duration,
    pub network_timeout: Option<Duration>,
    pub matchers: Vec<RequestMatcher>,
}

impl CacheClassConfig {
    /// Storage partition name, `<name>-v<version>`.
    pub fn cache_name(&self) -> String {
        format!("{}-v{}", self.name, self.version)
    }

    pub fn matches(&self, request: &FetchRequest) -> bool {
        self.matchers.iter().any(|matcher| matcher.matches(request))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientCacheConfig {
    /// Classes in match order; the first matching class wins.
    pub classes: Vec<CacheClassConfig>,
    pub quota_bytes: u64,
    /// Fraction of the quota above which writes are skipped.
    pub quota_threshold: f64,
}

impl Default for ClientCacheConfig {
    fn default() -> Self {
        Self {
            classes: default_classes(),
            quota_bytes: DEFAULT_QUOTA_BYTES,
            quota_threshold: DEFAULT_QUOTA_THRESHOLD,
        }
    }
}

impl From<&crate::config::ClientSettings> for ClientCacheConfig {
    fn from(settings: &crate::config::ClientSettings) -> Self {
        Self {
            quota_bytes: settings.quota_bytes,
            quota_threshold: settings.quota_threshold,
            ..Self::default()
        }
    }
}

impl ClientCacheConfig {
    pub fn class_for(&self, request: &FetchRequest) -> Option<&CacheClassConfig> {
        self.classes.iter().find(|class| class.matches(request))
    }

    /// Class stored under the partition `cache_name`.
    pub fn class(&self, cache_name: &str) -> Option<&CacheClassConfig> {
        self.classes
            .iter()
            .find(|class| class.cache_name() == cache_name)
    }

    pub fn cache_names(&self) -> Vec<String> {
        self.classes.iter().map(CacheClassConfig::cache_name).collect()
    }
}

fn default_classes() -> Vec<CacheClassConfig> {
    vec![
        CacheClassConfig {
            name: "static-assets".to_string(),
            version: 1,
            strategy: CacheStrategy::CacheFirst,
            max_entries: 100,
            max_age: Duration::from_secs(30 * DAY),
            network_timeout: None,
            matchers: vec![
                RequestMatcher::PathPrefix("/static/".to_string()),
                RequestMatcher::Extensions(
                    ["js", "css", "png", "jpg", "jpeg", "svg", "ico", "woff", "woff2"]
                        .into_iter()
                        .map(str::to_string)
                        .collect(),
                ),
            ],
        },
        CacheClassConfig {
            name: "api-responses".to_string(),
            version: 1,
            strategy: CacheStrategy::NetworkFirst,
            max_entries: 50,
            max_age: Duration::from_secs(5 * 60),
            network_timeout: Some(Duration::from_secs(3)),
            matchers: vec![RequestMatcher::PathPrefix("/api/".to_string())],
        },
        CacheClassConfig {
            name: "offline".to_string(),
            version: 1,
            strategy: CacheStrategy::CacheOnly,
            max_entries: 10,
            max_age: Duration::from_secs(7 * DAY),
            network_timeout: None,
            matchers: vec![RequestMatcher::PathPrefix("/offline".to_string())],
        },
        CacheClassConfig {
            name: "dynamic-pages".to_string(),
            version: 1,
            strategy: CacheStrategy::StaleWhileRevalidate,
            max_entries: 30,
            max_age: Duration::from_secs(DAY),
            network_timeout: None,
            matchers: vec![RequestMatcher::Any],
        },
    ]
}
