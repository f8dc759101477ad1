//! Read-only health and statistics aggregation.

use std::collections::BTreeMap;
use std::sync::Arc;

use devpulse_api_types::{HealthReport, HealthStatus, OperationChecks, StatsReport, StoreHealth};
use serde_json::{Value, json};
use tracing::warn;
use uuid::Uuid;

use super::backend::StoreError;
use super::engine::TriggerEngine;
use super::keys::Category;
use super::store::KeyedStore;

/// Expiry of the probe key, so a crash between set and delete leaves no residue.
const PROBE_TTL_SECS: u64 = 60;

pub struct HealthReporter {
    store: Arc<KeyedStore>,
    engine: Arc<TriggerEngine>,
}

impl HealthReporter {
    pub fn new(store: Arc<KeyedStore>, engine: Arc<TriggerEngine>) -> Self {
        Self { store, engine }
    }

    pub fn stats(&self) -> StatsReport {
        self.store.stats().snapshot()
    }

    /// Ping the store, run a set/get/ttl/delete round and count keys per category.
    ///
    /// Unlike regular reads, store errors are surfaced here.
    pub async fn report(&self) -> HealthReport {
        let (store, reachable) = match self.store.ping().await {
            Ok(latency) => (
                StoreHealth {
                    backend: self.store.backend_name().to_string(),
                    reachable: true,
                    latency_ms: latency.as_millis() as u64,
                    error: None,
                },
                true,
            ),
            Err(err) => {
                warn!(backend = self.store.backend_name(), error = %err, "Store ping failed");
                (
                    StoreHealth {
                        backend: self.store.backend_name().to_string(),
                        reachable: false,
                        latency_ms: 0,
                        error: Some(err.to_string()),
                    },
                    false,
                )
            }
        };

        let (checks, namespaces) = if reachable {
            (self.probe().await, self.namespaces().await)
        } else {
            (OperationChecks::default(), BTreeMap::new())
        };

        let status = match (reachable, checks.all_passed()) {
            (true, true) => HealthStatus::Healthy,
            (true, false) => HealthStatus::Degraded,
            (false, _) => HealthStatus::Unhealthy,
        };

        HealthReport {
            status,
            store,
            checks,
            namespaces,
            triggers: self.engine.status(),
            stats: self.stats(),
        }
    }

    /// Exercise the backend directly so probes never count as hits or misses.
    async fn probe(&self) -> OperationChecks {
        let backend = self.store.backend();
        let key = self.store.keys().health_probe(&Uuid::new_v4().simple().to_string());
        let payload = json!({ "probe": key });

        let set = passed(
            "set",
            backend
                .set(&key, &payload.to_string(), Some(PROBE_TTL_SECS))
                .await,
        )
        .is_some();
        let get = passed("get", backend.get(&key).await)
            .flatten()
            .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
            .is_some_and(|value| value == payload);
        let ttl = passed("ttl", backend.ttl(&key).await)
            .is_some_and(|remaining| remaining > 0 && remaining <= PROBE_TTL_SECS as i64);
        let delete = passed("delete", backend.del(std::slice::from_ref(&key)).await)
            .is_some_and(|removed| removed == 1);

        OperationChecks {
            set,
            get,
            ttl,
            delete,
        }
    }

    async fn namespaces(&self) -> BTreeMap<String, u64> {
        let keys = self.store.keys();
        let mut counts = BTreeMap::new();
        for category in Category::ALL {
            match self.store.count(&keys.category_pattern(category)).await {
                Ok(count) => {
                    counts.insert(category.as_str().to_string(), count);
                }
                Err(err) => {
                    warn!(category = %category, error = %err, "Failed to count keys");
                }
            }
        }
        counts
    }
}

fn passed<T>(check: &'static str, result: Result<T, StoreError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(check, error = %err, "Health probe step failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::config::CacheConfig;
    use super::super::events::EventQueue;
    use super::super::invalidation::InvalidationService;
    use super::super::keys::{KeySpace, Provider};
    use super::super::store::tests::{DownBackend, memory_store};
    use super::super::trigger::TriggerRegistry;
    use super::*;

    fn reporter(store: KeyedStore) -> HealthReporter {
        let store = Arc::new(store);
        let engine = Arc::new(TriggerEngine::new(
            TriggerRegistry::builtin().expect("builtin"),
            Arc::new(EventQueue::new(8)),
            Arc::new(InvalidationService::new(store.clone())),
        ));
        HealthReporter::new(store, engine)
    }

    #[tokio::test]
    async fn healthy_store_passes_every_check() {
        let store = memory_store();
        let keys = store.keys().clone();
        assert!(store.set(&keys.session("u1"), &"s", Some(60), &[]).await);
        assert!(store.set(&keys.provider(Provider::Github, "u1", None), &"g", None, &[]).await);
        let reporter = reporter(store);

        let report = reporter.report().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.store.reachable);
        assert!(report.checks.all_passed());
        assert_eq!(report.namespaces.get("session"), Some(&1));
        assert_eq!(report.namespaces.get("github"), Some(&1));
        assert_eq!(report.namespaces.get("health"), Some(&0));
        assert_eq!(report.triggers.total, 7);
    }

    #[tokio::test]
    async fn health_checks_leave_hit_rate_untouched() {
        let store = memory_store();
        assert!(store.set("devpulse:session:u1", &"s", None, &[]).await);
        assert!(store.get_value("devpulse:session:u1").await.is_some());
        let reporter = reporter(store);

        let report = reporter.report().await;
        assert!(report.checks.all_passed());
        let stats = reporter.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.invalidated, 0);
    }

    #[tokio::test]
    async fn unreachable_store_is_unhealthy() {
        let config = CacheConfig::default();
        let keys = KeySpace::new(&config.namespace).expect("valid namespace");
        let reporter = reporter(KeyedStore::new(Arc::new(DownBackend), keys, &config));

        let report = reporter.report().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(!report.store.reachable);
        assert!(report.store.error.is_some());
        assert!(report.namespaces.is_empty());
    }
}
