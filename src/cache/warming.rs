//! Cache warming.
//!
//! Populates likely-needed keys ahead of demand. Warming only fills gaps: it
//! writes with set-if-absent, so an entry written by a collaborator in the
//! meantime always wins.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devpulse_api_types::{NavigationPattern, WarmReport};
use futures::{StreamExt, stream};
use metrics::counter;
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use url::Url;

use super::backend::StoreError;
use super::config::TtlPolicy;
use super::keys::{Category, KeyError, Provider, require};
use super::store::KeyedStore;

const METRIC_CACHE_WARM: &str = "devpulse_cache_warm_total";
const USER_HEADER: &str = "x-devpulse-user";

const DEFAULT_TOP_N: usize = 3;
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);
const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Debug, Error)]
pub enum WarmError {
    #[error("{0}")]
    Validation(String),
    #[error("invalid upstream url for `{path}`: {source}")]
    Url {
        path: String,
        #[source]
        source: url::ParseError,
    },
    #[error("warm path `{path}` {reason}")]
    UnsafePath { path: String, reason: &'static str },
    #[error("request to `{path}` failed: {source}")]
    Request {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("upstream returned {status} for `{path}`")]
    Upstream { path: String, status: u16 },
    #[error("warming `{key}` timed out after {timeout_ms} ms")]
    Timeout { key: String, timeout_ms: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<KeyError> for WarmError {
    fn from(err: KeyError) -> Self {
        Self::Validation(err.to_string())
    }
}

/// One key to warm and the upstream path that produces its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmTarget {
    pub user_id: String,
    pub key: String,
    pub path: String,
    pub ttl: Option<u64>,
}

/// Source of values for warming.
#[async_trait]
pub trait WarmLoader: Send + Sync {
    /// Value for `target`, or `None` when upstream has nothing to cache.
    async fn load(&self, target: &WarmTarget) -> Result<Option<Value>, WarmError>;
}

/// Loader used when no upstream origin is configured; every target is skipped.
pub struct DisabledWarmLoader;

#[async_trait]
impl WarmLoader for DisabledWarmLoader {
    async fn load(&self, _target: &WarmTarget) -> Result<Option<Value>, WarmError> {
        Ok(None)
    }
}

/// Loads values by issuing `GET <origin><path>` on behalf of the user.
pub struct HttpWarmLoader {
    client: reqwest::Client,
    origin: Url,
}

impl HttpWarmLoader {
    pub fn new(origin: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            origin,
        }
    }
}

#[async_trait]
impl WarmLoader for HttpWarmLoader {
    async fn load(&self, target: &WarmTarget) -> Result<Option<Value>, WarmError> {
        let url = resolve_warm_url(&self.origin, &target.path)?;
        let response = self
            .client
            .get(url)
            .header(USER_HEADER, &target.user_id)
            .send()
            .await
            .map_err(|source| WarmError::Request {
                path: target.path.clone(),
                source,
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(WarmError::Upstream {
                path: target.path.clone(),
                status: status.as_u16(),
            });
        }
        let value = response
            .json::<Value>()
            .await
            .map_err(|source| WarmError::Request {
                path: target.path.clone(),
                source,
            })?;
        Ok(Some(value))
    }
}

/// Reject paths that could leave the warming origin.
pub fn check_warm_path(path: &str) -> Result<(), WarmError> {
    let unsafe_path = |reason: &'static str| -> Result<(), WarmError> {
        Err(WarmError::UnsafePath {
            path: path.to_string(),
            reason,
        })
    };
    let path = path.trim();
    if path.is_empty() {
        return unsafe_path("is empty");
    }
    if path.contains('\\') {
        return unsafe_path("contains a backslash");
    }
    if path.starts_with("//") {
        return unsafe_path("is protocol-relative");
    }
    if Url::parse(path).is_ok() {
        return unsafe_path("carries a scheme");
    }
    let traverses = path
        .split(['/', '?', '#'])
        .map(|segment| segment.to_ascii_lowercase())
        .any(|segment| matches!(segment.as_str(), ".." | "%2e%2e" | ".%2e" | "%2e."));
    if traverses {
        return unsafe_path("contains a `..` segment");
    }
    Ok(())
}

/// Join `path` onto `origin`, refusing anything that resolves elsewhere.
pub fn resolve_warm_url(origin: &Url, path: &str) -> Result<Url, WarmError> {
    check_warm_path(path)?;
    let url = origin
        .join(path.trim().trim_start_matches('/'))
        .map_err(|source| WarmError::Url {
            path: path.to_string(),
            source,
        })?;
    let base = origin.path().rsplit_once('/').map_or("", |(dir, _)| dir);
    if url.origin() != origin.origin() || !url.path().starts_with(base) {
        return Err(WarmError::UnsafePath {
            path: path.to_string(),
            reason: "resolves outside the warming origin",
        });
    }
    Ok(url)
}

/// Percent-encode `value` for use as one path segment.
fn path_segment(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarmingConfig {
    /// Navigation paths warmed by intelligent preload.
    pub top_n: usize,
    /// Upper bound for loading and storing one key.
    pub timeout: Duration,
    pub concurrency: usize,
}

impl Default for WarmingConfig {
    fn default() -> Self {
        Self {
            top_n: DEFAULT_TOP_N,
            timeout: DEFAULT_TIMEOUT,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl From<&crate::config::WarmingSettings> for WarmingConfig {
    fn from(settings: &crate::config::WarmingSettings) -> Self {
        Self {
            top_n: settings.top_n,
            timeout: settings.timeout,
            concurrency: settings.concurrency.get(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WarmOutcome {
    Warmed,
    Skipped,
    Failed,
}

impl WarmOutcome {
    fn as_str(self) -> &'static str {
        match self {
            WarmOutcome::Warmed => "warmed",
            WarmOutcome::Skipped => "skipped",
            WarmOutcome::Failed => "failed",
        }
    }
}

pub struct CacheWarmer {
    store: Arc<KeyedStore>,
    loader: Arc<dyn WarmLoader>,
    ttl: TtlPolicy,
    config: WarmingConfig,
}

impl CacheWarmer {
    pub fn new(
        store: Arc<KeyedStore>,
        loader: Arc<dyn WarmLoader>,
        ttl: TtlPolicy,
        config: WarmingConfig,
    ) -> Self {
        Self {
            store,
            loader,
            ttl,
            config,
        }
    }

    /// Session, default dashboard and profile for one user.
    pub async fn warm_critical_session(&self, user_id: &str) -> Result<WarmReport, WarmError> {
        require(user_id, "userId")?;
        let keys = self.store.keys();
        let segment = path_segment(user_id);
        let targets = vec![
            WarmTarget {
                user_id: user_id.to_string(),
                key: keys.session(user_id),
                path: format!("/api/session/{segment}"),
                ttl: self.ttl.for_category(Category::Session),
            },
            WarmTarget {
                user_id: user_id.to_string(),
                key: keys.dashboard(user_id),
                path: format!("/api/dashboard/{segment}"),
                ttl: self.ttl.for_category(Category::Dashboard),
            },
            WarmTarget {
                user_id: user_id.to_string(),
                key: keys.user_profile(user_id),
                path: format!("/api/users/{segment}/profile"),
                ttl: self.ttl.for_category(Category::User),
            },
        ];
        Ok(self.warm_targets("critical", targets).await)
    }

    pub async fn warm_provider(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<WarmReport, WarmError> {
        require(user_id, "userId")?;
        let target = WarmTarget {
            user_id: user_id.to_string(),
            key: self.store.keys().provider(provider, user_id, None),
            path: format!("/api/{provider}/{}", path_segment(user_id)),
            ttl: self.ttl.for_category(provider.category()),
        };
        Ok(self.warm_targets("provider", vec![target]).await)
    }

    /// Warm the most visited paths.
    pub async fn intelligent_preload(
        &self,
        user_id: &str,
        patterns: &[NavigationPattern],
    ) -> Result<WarmReport, WarmError> {
        require(user_id, "userId")?;
        let paths = rank_paths(patterns, self.config.top_n);
        for path in &paths {
            check_warm_path(path)?;
        }
        let targets = paths
            .iter()
            .map(|path| self.preload_target(user_id, path))
            .collect();
        Ok(self.warm_targets("intelligent", targets).await)
    }

    /// Warm `paths`, or the paths typical for the current UTC hour when empty.
    pub async fn time_based_preload(
        &self,
        user_id: &str,
        paths: &[String],
    ) -> Result<WarmReport, WarmError> {
        require(user_id, "userId")?;
        let paths: Vec<String> = if paths.is_empty() {
            paths_for_hour(OffsetDateTime::now_utc().hour())
                .iter()
                .map(|path| path.to_string())
                .collect()
        } else {
            for path in paths {
                check_warm_path(path)?;
            }
            paths.to_vec()
        };
        let targets = paths
            .iter()
            .map(|path| self.preload_target(user_id, path))
            .collect();
        Ok(self.warm_targets("time_based", targets).await)
    }

    fn preload_target(&self, user_id: &str, path: &str) -> WarmTarget {
        WarmTarget {
            user_id: user_id.to_string(),
            key: self.store.keys().preload(user_id, path),
            path: path.to_string(),
            ttl: self.ttl.for_category(Category::Preload),
        }
    }

    /// Warm every target concurrently; one failure never stops the rest.
    pub async fn warm_targets(&self, mode: &'static str, targets: Vec<WarmTarget>) -> WarmReport {
        let concurrency = self.config.concurrency.max(1);
        let outcomes: Vec<WarmOutcome> = stream::iter(targets)
            .map(|target| self.warm_one(mode, target))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut report = WarmReport::default();
        for outcome in outcomes {
            match outcome {
                WarmOutcome::Warmed => report.warmed += 1,
                WarmOutcome::Skipped => report.skipped += 1,
                WarmOutcome::Failed => report.failed += 1,
            }
        }
        info!(
            mode,
            warmed = report.warmed,
            skipped = report.skipped,
            failed = report.failed,
            "Cache warming complete"
        );
        report
    }

    async fn warm_one(&self, mode: &'static str, target: WarmTarget) -> WarmOutcome {
        let outcome = match self.try_warm(&target).await {
            Ok(true) => WarmOutcome::Warmed,
            Ok(false) => WarmOutcome::Skipped,
            Err(err) => {
                warn!(mode, key = %target.key, path = %target.path, error = %err, "Cache warming failed");
                WarmOutcome::Failed
            }
        };
        counter!(METRIC_CACHE_WARM, "mode" => mode, "outcome" => outcome.as_str()).increment(1);
        outcome
    }

    async fn try_warm(&self, target: &WarmTarget) -> Result<bool, WarmError> {
        tokio::time::timeout(self.config.timeout, self.load_and_store(target))
            .await
            .map_err(|_| WarmError::Timeout {
                key: target.key.clone(),
                timeout_ms: self.config.timeout.as_millis() as u64,
            })?
    }

    async fn load_and_store(&self, target: &WarmTarget) -> Result<bool, WarmError> {
        if self.store.exists(&target.key).await {
            debug!(key = %target.key, "Cache entry already present; skipping warm");
            return Ok(false);
        }
        match self.loader.load(target).await? {
            Some(value) => Ok(self
                .store
                .set_if_absent(&target.key, &value, target.ttl)
                .await?),
            None => Ok(false),
        }
    }
}

/// Top `limit` distinct paths by total frequency; ties keep first appearance.
pub fn rank_paths(patterns: &[NavigationPattern], limit: usize) -> Vec<String> {
    let mut totals: HashMap<&str, (u64, usize)> = HashMap::new();
    for (index, pattern) in patterns.iter().enumerate() {
        let path = pattern.path.trim();
        if path.is_empty() {
            continue;
        }
        let entry = totals.entry(path).or_insert((0, index));
        entry.0 += u64::from(pattern.frequency);
    }

    let mut ranked: Vec<_> = totals.into_iter().collect();
    ranked.sort_by(|(_, (freq_a, first_a)), (_, (freq_b, first_b))| {
        freq_b.cmp(freq_a).then(first_a.cmp(first_b))
    });
    ranked
        .into_iter()
        .take(limit)
        .map(|(path, _)| path.to_string())
        .collect()
}

/// Paths a user typically opens at `hour` (UTC).
pub fn paths_for_hour(hour: u8) -> &'static [&'static str] {
    match hour {
        6..=9 => &["/github", "/slack"],
        10..=17 => &["/dashboard", "/github"],
        18..=23 => &["/ai/summary"],
        _ => &["/dashboard"],
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::super::store::tests::memory_store;
    use super::*;

    /// Loader answering from a fixed table; unknown paths fail.
    struct TableLoader {
        values: HashMap<String, Value>,
        slow: Option<String>,
        calls: Mutex<Vec<String>>,
    }

    impl TableLoader {
        fn new(pairs: &[(&str, Value)]) -> Self {
            Self {
                values: pairs
                    .iter()
                    .map(|(path, value)| (path.to_string(), value.clone()))
                    .collect(),
                slow: None,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl WarmLoader for TableLoader {
        async fn load(&self, target: &WarmTarget) -> Result<Option<Value>, WarmError> {
            self.calls
                .lock()
                .expect("calls lock")
                .push(target.path.clone());
            if self.slow.as_deref() == Some(target.path.as_str()) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            self.values
                .get(&target.path)
                .cloned()
                .map(Some)
                .ok_or_else(|| WarmError::Upstream {
                    path: target.path.clone(),
                    status: 502,
                })
        }
    }

    fn warmer(loader: TableLoader) -> (CacheWarmer, Arc<KeyedStore>) {
        let store = Arc::new(memory_store());
        let warmer = CacheWarmer::new(
            store.clone(),
            Arc::new(loader),
            TtlPolicy::default(),
            WarmingConfig::default(),
        );
        (warmer, store)
    }

    #[tokio::test]
    async fn critical_session_fills_missing_keys() {
        let (warmer, store) = warmer(TableLoader::new(&[
            ("/api/session/u1", json!({"token": "t"})),
            ("/api/dashboard/u1", json!({"widgets": []})),
            ("/api/users/u1/profile", json!({"name": "Ada"})),
        ]));

        let report = warmer.warm_critical_session("u1").await.expect("warmed");
        assert_eq!(report.warmed, 3);

        let keys = store.keys().clone();
        let session: Value = store.get(&keys.session("u1")).await.expect("cached");
        assert_eq!(session["token"], "t");
        let ttl = store.ttl(&keys.session("u1")).await;
        assert!(ttl > 0 && ttl <= 1800);
    }

    #[tokio::test]
    async fn warming_never_overwrites_existing_entries() {
        let (warmer, store) = warmer(TableLoader::new(&[
            ("/api/session/u1", json!("stale")),
            ("/api/dashboard/u1", json!("warm")),
            ("/api/users/u1/profile", json!("warm")),
        ]));
        let keys = store.keys().clone();
        assert!(store.set(&keys.session("u1"), &"fresh", Some(60), &[]).await);

        let report = warmer.warm_critical_session("u1").await.expect("warmed");
        assert_eq!(report.skipped, 1);
        assert_eq!(report.warmed, 2);
        let session: String = store.get(&keys.session("u1")).await.expect("cached");
        assert_eq!(session, "fresh");
    }

    #[tokio::test]
    async fn failed_key_does_not_abort_the_rest() {
        let (warmer, _store) = warmer(TableLoader::new(&[
            ("/api/session/u1", json!(1)),
            ("/api/users/u1/profile", json!(3)),
        ]));
        let report = warmer.warm_critical_session("u1").await.expect("warmed");
        assert_eq!(report.warmed, 2);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_loader_times_out() {
        let mut loader = TableLoader::new(&[("/api/github/u1", json!([]))]);
        loader.slow = Some("/api/github/u1".to_string());
        let (warmer, store) = warmer(loader);

        let report = warmer
            .warm_provider("u1", Provider::Github)
            .await
            .expect("warm attempted");
        assert_eq!(report.failed, 1);
        let keys = store.keys().clone();
        assert!(!store.exists(&keys.provider(Provider::Github, "u1", None)).await);
    }

    #[tokio::test]
    async fn intelligent_preload_warms_top_paths() {
        let (warmer, store) = warmer(TableLoader::new(&[
            ("/dashboard", json!(1)),
            ("/github", json!(2)),
            ("/slack", json!(3)),
            ("/settings", json!(4)),
        ]));
        let patterns = vec![
            NavigationPattern { path: "/settings".into(), frequency: 1 },
            NavigationPattern { path: "/github".into(), frequency: 5 },
            NavigationPattern { path: "/dashboard".into(), frequency: 9 },
            NavigationPattern { path: "/slack".into(), frequency: 2 },
        ];

        let report = warmer.intelligent_preload("u1", &patterns).await.expect("warmed");
        assert_eq!(report.warmed, 3);
        let keys = store.keys().clone();
        assert!(store.exists(&keys.preload("u1", "/dashboard")).await);
        assert!(store.exists(&keys.preload("u1", "/github")).await);
        assert!(!store.exists(&keys.preload("u1", "/settings")).await);
    }

    #[test]
    fn ranking_breaks_ties_by_first_appearance() {
        let patterns = vec![
            NavigationPattern { path: "/b".into(), frequency: 2 },
            NavigationPattern { path: "/a".into(), frequency: 2 },
            NavigationPattern { path: "/c".into(), frequency: 3 },
            NavigationPattern { path: "/a".into(), frequency: 2 },
        ];
        assert_eq!(rank_paths(&patterns, 3), vec!["/a", "/c", "/b"]);
        assert_eq!(rank_paths(&patterns, 1), vec!["/c"]);
    }

    #[tokio::test]
    async fn time_based_preload_uses_supplied_paths() {
        let (warmer, _store) = warmer(TableLoader::new(&[("/dashboard", json!({}))]));
        let report = warmer
            .time_based_preload("u1", &["/dashboard".to_string()])
            .await
            .expect("warmed");
        assert_eq!(report.warmed, 1);
    }

    #[test]
    fn hour_heuristics() {
        assert_eq!(paths_for_hour(7), &["/github", "/slack"]);
        assert_eq!(paths_for_hour(14), &["/dashboard", "/github"]);
        assert_eq!(paths_for_hour(20), &["/ai/summary"]);
        assert_eq!(paths_for_hour(3), &["/dashboard"]);
    }

    #[tokio::test]
    async fn disabled_loader_skips_everything() {
        let store = Arc::new(memory_store());
        let warmer = CacheWarmer::new(
            store,
            Arc::new(DisabledWarmLoader),
            TtlPolicy::default(),
            WarmingConfig::default(),
        );
        let report = warmer.warm_critical_session("u1").await.expect("warmed");
        assert_eq!(report.skipped, 3);
    }

    #[tokio::test]
    async fn blank_user_is_rejected() {
        let (warmer, _store) = warmer(TableLoader::new(&[]));
        let err = warmer.warm_critical_session(" ").await.expect_err("blank user");
        assert!(matches!(err, WarmError::Validation(_)));
    }

    #[tokio::test]
    async fn http_loader_refuses_absolute_paths() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind listener");
        let port = listener.local_addr().expect("local addr").port();
        let loader = HttpWarmLoader::new(Url::parse("http://origin.invalid/").expect("origin"));
        let target = WarmTarget {
            user_id: "u1".to_string(),
            key: "devpulse:preload:u1:steal".to_string(),
            path: format!("http://127.0.0.1:{port}/steal"),
            ttl: None,
        };

        let err = loader.load(&target).await.expect_err("foreign host");
        assert!(matches!(err, WarmError::UnsafePath { .. }), "{err}");
        let accepted =
            tokio::time::timeout(Duration::from_millis(50), listener.accept()).await;
        assert!(accepted.is_err(), "no request may reach the foreign host");
    }

    #[test]
    fn warm_urls_stay_under_the_origin() {
        let origin = Url::parse("http://origin.test/app/").expect("origin");
        for path in [
            "//evil.test/x",
            "https://evil.test/x",
            "/a/../b",
            "/a/%2E%2E/b",
            "\\evil.test\\x",
            " ",
        ] {
            let err = resolve_warm_url(&origin, path).expect_err(path);
            assert!(matches!(err, WarmError::UnsafePath { .. }), "{path}: {err}");
        }

        let url = resolve_warm_url(&origin, "/github?page=2").expect("relative path");
        assert_eq!(url.as_str(), "http://origin.test/app/github?page=2");
    }

    #[tokio::test]
    async fn user_ids_are_encoded_as_one_segment() {
        let loader = Arc::new(TableLoader::new(&[]));
        let warmer = CacheWarmer::new(
            Arc::new(memory_store()),
            loader.clone(),
            TtlPolicy::default(),
            WarmingConfig::default(),
        );

        warmer
            .warm_provider("a/../b c", Provider::Github)
            .await
            .expect("warm attempted");
        let calls = loader.calls.lock().expect("calls lock").clone();
        assert_eq!(calls, vec!["/api/github/a%2F..%2Fb%20c".to_string()]);
    }

    #[tokio::test]
    async fn preload_rejects_foreign_paths_before_loading() {
        let loader = Arc::new(TableLoader::new(&[]));
        let warmer = CacheWarmer::new(
            Arc::new(memory_store()),
            loader.clone(),
            TtlPolicy::default(),
            WarmingConfig::default(),
        );
        let patterns = vec![NavigationPattern {
            path: "//evil.test/steal".to_string(),
            frequency: 3,
        }];

        let err = warmer
            .intelligent_preload("u1", &patterns)
            .await
            .expect_err("foreign path");
        assert!(matches!(err, WarmError::UnsafePath { .. }));
        let err = warmer
            .time_based_preload("u1", &["http://evil.test/".to_string()])
            .await
            .expect_err("foreign path");
        assert!(matches!(err, WarmError::UnsafePath { .. }));
        assert!(loader.calls.lock().expect("calls lock").is_empty());
    }
}
