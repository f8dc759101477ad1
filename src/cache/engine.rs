//! Trigger rule engine.
//!
//! Matches domain events against the registry and runs each matching
//! trigger's actions through the invalidation service.

use std::sync::{Arc, RwLock};

use devpulse_api_types::{FireReport, TriggerStatus};
use metrics::counter;
use tracing::{info, warn};

use super::events::{DomainEvent, EventContext, EventQueue};
use super::invalidation::InvalidationService;
use super::lock::{rw_read, rw_write};
use super::trigger::{TriggerError, TriggerRegistry};

const SOURCE: &str = "cache::engine";
const METRIC_TRIGGER_ACTION: &str = "devpulse_cache_trigger_action_total";

pub struct TriggerEngine {
    registry: RwLock<Arc<TriggerRegistry>>,
    queue: Arc<EventQueue>,
    invalidation: Arc<InvalidationService>,
}

impl TriggerEngine {
    pub fn new(
        registry: TriggerRegistry,
        queue: Arc<EventQueue>,
        invalidation: Arc<InvalidationService>,
    ) -> Self {
        Self {
            registry: RwLock::new(Arc::new(registry)),
            queue,
            invalidation,
        }
    }

    /// Snapshot of the current registry.
    pub fn registry(&self) -> Arc<TriggerRegistry> {
        rw_read(&self.registry, SOURCE, "registry").clone()
    }

    /// Enable or disable one trigger by swapping in a new registry.
    ///
    /// Events already firing keep the snapshot they started with.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), TriggerError> {
        let mut registry = rw_write(&self.registry, SOURCE, "set_enabled");
        let next = registry.with_enabled(id, enabled)?;
        *registry = Arc::new(next);
        info!(trigger_id = id, enabled, "Trigger toggled");
        Ok(())
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn invalidation(&self) -> &Arc<InvalidationService> {
        &self.invalidation
    }

    /// Stamp an event with the next epoch.
    pub fn event(
        &self,
        event_type: impl Into<String>,
        data_type: impl Into<String>,
        context: EventContext,
    ) -> DomainEvent {
        self.queue.event(event_type, data_type, context)
    }

    /// Queue an event for the background consumer.
    pub fn publish(&self, event: DomainEvent) {
        self.queue.push(event);
    }

    /// Run every matching trigger's actions now.
    ///
    /// Actions run in declared order. A failing action is counted and logged
    /// and never stops later actions or triggers.
    pub async fn fire(&self, event: &DomainEvent) -> FireReport {
        let registry = self.registry();
        let keys = self.invalidation.store().keys();
        let mut report = FireReport::default();

        for trigger in registry.matching(&event.event_type, &event.data_type) {
            report.matched_triggers += 1;
            for action in &trigger.actions {
                let outcome = match action.resolve(&event.context, keys) {
                    Ok(resolved) => self
                        .invalidation
                        .execute_action(&resolved)
                        .await
                        .map_err(|err| err.to_string()),
                    Err(err) => Err(err.to_string()),
                };
                match outcome {
                    Ok(count) => {
                        report.succeeded_actions += 1;
                        report.invalidated_entries += count;
                        counter!(METRIC_TRIGGER_ACTION, "result" => "ok").increment(1);
                    }
                    Err(error) => {
                        report.failed_actions += 1;
                        counter!(METRIC_TRIGGER_ACTION, "result" => "error").increment(1);
                        warn!(
                            event_id = %event.id,
                            trigger_id = %trigger.id,
                            invalidation_type = %action.invalidation_type,
                            scope = %action.scope,
                            error = %error,
                            "Trigger action failed"
                        );
                    }
                }
            }
        }

        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            data_type = %event.data_type,
            matched = report.matched_triggers,
            succeeded = report.succeeded_actions,
            failed = report.failed_actions,
            invalidated = report.invalidated_entries,
            "Domain event fired"
        );
        report
    }

    pub fn status(&self) -> TriggerStatus {
        let registry = self.registry();
        TriggerStatus {
            total: registry.len(),
            enabled: registry.enabled_count(),
            queued_events: self.queue.len(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::super::events::{context_keys, data_types, event_types};
    use super::super::keys::Provider;
    use super::super::store::tests::memory_store;
    use super::*;

    pub(crate) fn engine() -> TriggerEngine {
        let store = Arc::new(memory_store());
        TriggerEngine::new(
            TriggerRegistry::builtin().expect("builtin"),
            Arc::new(EventQueue::new(16)),
            Arc::new(InvalidationService::new(store)),
        )
    }

    fn ctx(pairs: &[(&str, &str)]) -> EventContext {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    async fn seed(engine: &TriggerEngine) {
        let store = engine.invalidation().store();
        let keys = store.keys().clone();
        for key in [
            keys.provider(Provider::Github, "u1", Some("acme/api")),
            keys.ai_summary("u1", "2026-10-19"),
            keys.dashboard("u1"),
            keys.dashboard("u2"),
        ] {
            assert!(store.set(&key, &"v", Some(300), &[]).await);
        }
    }

    #[tokio::test]
    async fn push_event_invalidates_provider_ai_and_dashboard() {
        let engine = engine();
        seed(&engine).await;

        let event = engine.event(
            event_types::PUSH,
            data_types::GITHUB,
            ctx(&[(context_keys::USER_ID, "u1")]),
        );
        let report = engine.fire(&event).await;
        assert_eq!(report.matched_triggers, 1);
        assert_eq!(report.succeeded_actions, 3);
        assert_eq!(report.failed_actions, 0);
        assert_eq!(report.invalidated_entries, 3);

        let keys = engine.invalidation().store().keys().clone();
        assert!(engine.invalidation().store().exists(&keys.dashboard("u2")).await);
    }

    #[tokio::test]
    async fn firing_twice_is_idempotent() {
        let engine = engine();
        seed(&engine).await;
        let event = engine.event(
            event_types::PUSH,
            data_types::GITHUB,
            ctx(&[(context_keys::USER_ID, "u1")]),
        );

        engine.fire(&event).await;
        let second = engine.fire(&event).await;
        assert_eq!(second.succeeded_actions, 3);
        assert_eq!(second.invalidated_entries, 0);
    }

    #[tokio::test]
    async fn missing_placeholder_fails_one_action_only() {
        let engine = engine();
        let keys = engine.invalidation().store().keys().clone();
        let store = engine.invalidation().store();
        assert!(store.set(&keys.dashboard("u1"), &"v", None, &[]).await);

        let event = engine.event(
            event_types::MESSAGE,
            data_types::SLACK,
            ctx(&[(context_keys::USER_ID, "u1")]),
        );
        let report = engine.fire(&event).await;
        assert_eq!(report.failed_actions, 1);
        assert_eq!(report.succeeded_actions, 1);
        assert_eq!(report.invalidated_entries, 1);
    }

    #[tokio::test]
    async fn disabled_trigger_does_not_fire() {
        let engine = engine();
        let before = engine.registry();
        engine.set_enabled("github-push", false).expect("known trigger");

        let event = engine.event(
            event_types::PUSH,
            data_types::GITHUB,
            ctx(&[(context_keys::USER_ID, "u1")]),
        );
        assert_eq!(engine.fire(&event).await.matched_triggers, 0);
        assert_eq!(engine.status().enabled, before.enabled_count() - 1);
        assert!(before.get("github-push").expect("still present").enabled);
    }

    #[test]
    fn unknown_trigger_toggle_is_rejected() {
        let engine = engine();
        let err = engine.set_enabled("nope", true).expect_err("unknown");
        assert!(matches!(err, TriggerError::UnknownTrigger(_)));
    }

    #[test]
    fn status_counts_queue() {
        let engine = engine();
        let event = engine.event(event_types::PUSH, data_types::GITHUB, EventContext::new());
        engine.publish(event);
        let status = engine.status();
        assert_eq!(status.queued_events, 1);
        assert_eq!(status.total, 7);
    }
}
