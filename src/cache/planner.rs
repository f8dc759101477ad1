//! Consumption plan generation.
//!
//! Merges a batch of queued events into one list of resolved actions, so a
//! burst of events for the same resource costs one deletion.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use uuid::Uuid;

use super::events::DomainEvent;
use super::keys::KeySpace;
use super::trigger::{ResolvedAction, TriggerError, TriggerRegistry};

/// A scope that failed to resolve while planning.
#[derive(Debug, Clone)]
pub struct PlanFailure {
    pub event_id: Uuid,
    pub trigger_id: String,
    pub error: TriggerError,
}

#[derive(Debug, Default)]
pub struct ConsumptionPlan {
    /// Events that survived deduplication.
    pub event_count: usize,
    /// Trigger matches across all events.
    pub matched_triggers: usize,
    /// Unique resolved actions in first-seen order.
    pub actions: Vec<ResolvedAction>,
    pub failures: Vec<PlanFailure>,
    /// Users whose data was touched, used to re-warm their critical path.
    pub affected_users: BTreeSet<String>,
}

impl fmt::Display for ConsumptionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ConsumptionPlan {{ events: {}, matched: {}, actions: {}, failures: {}, users: {} }}",
            self.event_count,
            self.matched_triggers,
            self.actions.len(),
            self.failures.len(),
            self.affected_users.len(),
        )
    }
}

impl ConsumptionPlan {
    /// Merge events into a plan.
    ///
    /// - Deduplicates events by id
    /// - Resolves every matching trigger's actions in declared order
    /// - Drops actions identical to one already planned
    pub fn from_events(events: Vec<DomainEvent>, registry: &TriggerRegistry, keys: &KeySpace) -> Self {
        let mut plan = Self::default();
        let mut seen_ids = HashSet::new();
        let mut seen_actions = HashSet::new();

        let events: Vec<_> = events
            .into_iter()
            .filter(|event| seen_ids.insert(event.id))
            .collect();
        plan.event_count = events.len();

        for event in &events {
            let mut matched_any = false;
            for trigger in registry.matching(&event.event_type, &event.data_type) {
                matched_any = true;
                plan.matched_triggers += 1;
                for action in &trigger.actions {
                    match action.resolve(&event.context, keys) {
                        Ok(resolved) => {
                            if seen_actions.insert(resolved.clone()) {
                                plan.actions.push(resolved);
                            }
                        }
                        Err(error) => plan.failures.push(PlanFailure {
                            event_id: event.id,
                            trigger_id: trigger.id.clone(),
                            error,
                        }),
                    }
                }
            }
            if matched_any && let Some(user_id) = event.user_id() {
                plan.affected_users.insert(user_id.to_string());
            }
        }

        plan
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.failures.is_empty()
    }
}
