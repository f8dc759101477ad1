//! Queued event consumption.
//!
//! Drains events from the queue, merges them into one plan and executes it.

use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::config::CacheConfig;
use super::engine::TriggerEngine;
use super::planner::ConsumptionPlan;
use super::warming::CacheWarmer;

const METRIC_CACHE_CONSUME_MS: &str = "devpulse_cache_consume_ms";

/// Outcome of one consumption pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeReport {
    pub events: usize,
    pub actions: usize,
    pub failed: usize,
    pub invalidated: u64,
    pub warmed_users: usize,
}

impl ConsumeReport {
    pub fn is_empty(&self) -> bool {
        self.events == 0
    }
}

/// Event consumer that keeps the store consistent with queued events.
///
/// The consumer:
/// 1. Drains up to `consume_batch_limit` events
/// 2. Builds a deduplicated consumption plan
/// 3. Executes the plan's invalidations, then re-warms affected users
pub struct EventConsumer {
    config: CacheConfig,
    engine: Arc<TriggerEngine>,
    warmer: Option<Arc<CacheWarmer>>,
}

impl EventConsumer {
    pub fn new(
        config: CacheConfig,
        engine: Arc<TriggerEngine>,
        warmer: Option<Arc<CacheWarmer>>,
    ) -> Self {
        Self {
            config,
            engine,
            warmer,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Consume pending events with invalidation and warming.
    #[instrument(skip(self))]
    pub async fn consume(&self) -> ConsumeReport {
        self.consume_with_mode(true).await
    }

    /// Consume pending events and run only invalidation actions.
    ///
    /// Used on latency-sensitive paths where re-warming is deferred.
    #[instrument(skip(self))]
    pub async fn consume_invalidate_only(&self) -> ConsumeReport {
        self.consume_with_mode(false).await
    }

    #[instrument(skip(self))]
    pub async fn consume_full(&self) -> ConsumeReport {
        self.consume_with_mode(true).await
    }

    async fn consume_with_mode(&self, include_warm: bool) -> ConsumeReport {
        let started_at = Instant::now();
        let events = self.engine.queue().drain(self.config.consume_batch_limit);
        if events.is_empty() {
            return ConsumeReport::default();
        }

        let event_ids: Vec<Uuid> = events.iter().map(|event| event.id).collect();
        let registry = self.engine.registry();
        let invalidation = self.engine.invalidation();
        let plan = ConsumptionPlan::from_events(events, &registry, invalidation.store().keys());

        info!(
            event_count = plan.event_count,
            event_ids = ?event_ids,
            plan = %plan,
            include_warm,
            "Cache consumption starting"
        );

        let mut report = ConsumeReport {
            events: plan.event_count,
            failed: plan.failures.len(),
            ..Default::default()
        };
        for failure in &plan.failures {
            warn!(
                event_id = %failure.event_id,
                trigger_id = %failure.trigger_id,
                error = %failure.error,
                "Trigger action could not be resolved"
            );
        }

        // Phase 1: invalidate
        for action in &plan.actions {
            match invalidation.execute_action(action).await {
                Ok(count) => {
                    report.actions += 1;
                    report.invalidated += count;
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(action = %action, error = %err, "Planned invalidation failed");
                }
            }
        }

        // Phase 2: re-warm the critical path of every affected user
        if include_warm && let Some(warmer) = &self.warmer {
            for user_id in &plan.affected_users {
                match warmer.warm_critical_session(user_id).await {
                    Ok(_) => report.warmed_users += 1,
                    Err(err) => warn!(user_id = %user_id, error = %err, "Re-warming failed"),
                }
            }
        }

        info!(
            event_count = report.events,
            actions = report.actions,
            failed = report.failed,
            invalidated = report.invalidated,
            warmed_users = report.warmed_users,
            "Cache consumption complete"
        );

        histogram!(
            METRIC_CACHE_CONSUME_MS,
            "mode" => if include_warm { "full" } else { "invalidate_only" }
        )
        .record(started_at.elapsed().as_secs_f64() * 1000.0);

        report
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::config::TtlPolicy;
    use super::super::engine::tests::engine;
    use super::super::events::{EventContext, context_keys, data_types, event_types};
    use super::super::keys::Provider;
    use super::super::warming::{DisabledWarmLoader, WarmingConfig};
    use super::*;

    fn ctx(user: &str) -> EventContext {
        EventContext::from([(context_keys::USER_ID.to_string(), user.to_string())])
    }

    #[tokio::test]
    async fn empty_queue_is_a_no_op() {
        let consumer = EventConsumer::new(CacheConfig::default(), Arc::new(engine()), None);
        assert!(consumer.consume().await.is_empty());
    }

    #[tokio::test]
    async fn burst_of_events_is_merged() {
        let engine = Arc::new(engine());
        let store = engine.invalidation().store().clone();
        let keys = store.keys().clone();
        assert!(
            store
                .set(&keys.provider(Provider::Github, "u1", Some("acme/api")), &json!(1), None, &[])
                .await
        );

        for _ in 0..5 {
            engine
                .queue()
                .publish(event_types::PUSH, data_types::GITHUB, ctx("u1"));
        }
        let consumer = EventConsumer::new(CacheConfig::default(), engine.clone(), None);
        let report = consumer.consume_invalidate_only().await;

        assert_eq!(report.events, 5);
        assert_eq!(report.actions, 3);
        assert_eq!(report.invalidated, 1);
        assert!(engine.queue().is_empty());
    }

    #[tokio::test]
    async fn batch_limit_bounds_one_pass() {
        let engine = Arc::new(engine());
        for user in ["u1", "u2", "u3"] {
            engine
                .queue()
                .publish(event_types::PROFILE_UPDATE, data_types::USER, ctx(user));
        }
        let config = CacheConfig {
            consume_batch_limit: 2,
            ..Default::default()
        };
        let consumer = EventConsumer::new(config, engine.clone(), None);

        assert_eq!(consumer.consume().await.events, 2);
        assert_eq!(engine.queue().len(), 1);
    }

    #[tokio::test]
    async fn full_consumption_rewarms_affected_users() {
        let engine = Arc::new(engine());
        let warmer = Arc::new(CacheWarmer::new(
            engine.invalidation().store().clone(),
            Arc::new(DisabledWarmLoader),
            TtlPolicy::default(),
            WarmingConfig::default(),
        ));
        engine
            .queue()
            .publish(event_types::SETTINGS_CHANGE, data_types::SETTINGS, ctx("u1"));
        engine
            .queue()
            .publish(event_types::SETTINGS_CHANGE, data_types::SETTINGS, ctx("u2"));

        let consumer = EventConsumer::new(CacheConfig::default(), engine.clone(), Some(warmer));
        let report = consumer.consume_full().await;
        assert_eq!(report.warmed_users, 2);

        engine
            .queue()
            .publish(event_types::SETTINGS_CHANGE, data_types::SETTINGS, ctx("u3"));
        assert_eq!(consumer.consume_invalidate_only().await.warmed_users, 0);
    }
}
