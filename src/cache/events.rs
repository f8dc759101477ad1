//! Domain events that drive invalidation.
//!
//! Events are matched against triggers by `(event_type, data_type)`. They can
//! be fired inline or queued and consumed in batches.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use super::lock::mutex_lock;

const SOURCE: &str = "cache::events";
const METRIC_EVENT_QUEUE_LEN: &str = "devpulse_cache_event_queue_len";
const METRIC_EVENT_DROPPED: &str = "devpulse_cache_event_dropped_total";

/// Monotonic epoch for ordering events within this process.
pub type Epoch = u64;

/// Identifiers carried by an event, keyed by placeholder name (`userId`, ...).
pub type EventContext = BTreeMap<String, String>;

/// Well-known event types.
pub mod event_types {
    pub const PUSH: &str = "push";
    pub const PULL_REQUEST: &str = "pull_request";
    pub const ISSUES: &str = "issues";
    pub const MESSAGE: &str = "message";
    pub const PROFILE_UPDATE: &str = "profile_update";
    pub const REGENERATE: &str = "regenerate";
    pub const SETTINGS_CHANGE: &str = "settings_change";
}

/// Well-known data types.
pub mod data_types {
    pub const GITHUB: &str = "github";
    pub const SLACK: &str = "slack";
    pub const USER: &str = "user";
    pub const AI: &str = "ai";
    pub const SETTINGS: &str = "settings";
}

/// Context keys referenced by trigger scopes.
pub mod context_keys {
    pub const USER_ID: &str = "userId";
    pub const REPOSITORY: &str = "repository";
    pub const CHANNEL: &str = "channel";
    pub const RESOURCE_ID: &str = "resourceId";
    pub const ENDPOINT: &str = "endpoint";
    pub const DATE: &str = "date";
}

#[derive(Debug, Clone)]
pub struct DomainEvent {
    /// Unique identifier for idempotency (UUIDv4).
    pub id: Uuid,
    pub epoch: Epoch,
    pub event_type: String,
    pub data_type: String,
    pub context: EventContext,
    pub timestamp: OffsetDateTime,
}

impl DomainEvent {
    pub fn new(
        event_type: impl Into<String>,
        data_type: impl Into<String>,
        context: EventContext,
        epoch: Epoch,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            event_type: event_type.into(),
            data_type: data_type.into(),
            context,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.context.get(context_keys::USER_ID).map(String::as_str)
    }
}

/// Bounded FIFO of pending events.
///
/// When full, the oldest event is dropped; the TTL on every entry bounds the
/// staleness a dropped invalidation can cause.
pub struct EventQueue {
    queue: Mutex<VecDeque<DomainEvent>>,
    epoch_counter: AtomicU64,
    limit: usize,
}

impl EventQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            epoch_counter: AtomicU64::new(0),
            limit: limit.max(1),
        }
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Stamp a new event with the next epoch without queueing it.
    pub fn event(
        &self,
        event_type: impl Into<String>,
        data_type: impl Into<String>,
        context: EventContext,
    ) -> DomainEvent {
        DomainEvent::new(event_type, data_type, context, self.next_epoch())
    }

    /// Queue an event for later consumption.
    pub fn push(&self, event: DomainEvent) {
        info!(
            event_id = %event.id,
            event_epoch = event.epoch,
            event_type = %event.event_type,
            data_type = %event.data_type,
            "Cache event enqueued"
        );

        let mut queue = mutex_lock(&self.queue, SOURCE, "push");
        if queue.len() >= self.limit
            && let Some(dropped) = queue.pop_front()
        {
            counter!(METRIC_EVENT_DROPPED).increment(1);
            warn!(
                event_id = %dropped.id,
                limit = self.limit,
                "Cache event queue full; dropped oldest event"
            );
        }
        queue.push_back(event);
        gauge!(METRIC_EVENT_QUEUE_LEN).set(queue.len() as f64);
    }

    pub fn publish(
        &self,
        event_type: impl Into<String>,
        data_type: impl Into<String>,
        context: EventContext,
    ) -> Uuid {
        let event = self.event(event_type, data_type, context);
        let id = event.id;
        self.push(event);
        id
    }

    /// Drain up to `limit` events in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<DomainEvent> {
        let mut queue = mutex_lock(&self.queue, SOURCE, "drain");
        let count = limit.min(queue.len());
        let events: Vec<_> = queue.drain(..count).collect();
        gauge!(METRIC_EVENT_QUEUE_LEN).set(queue.len() as f64);
        events
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.queue, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        mutex_lock(&self.queue, SOURCE, "clear").clear();
        gauge!(METRIC_EVENT_QUEUE_LEN).set(0.0);
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    fn ctx(user: &str) -> EventContext {
        EventContext::from([(context_keys::USER_ID.to_string(), user.to_string())])
    }

    #[test]
    fn epoch_monotonicity() {
        let queue = EventQueue::new(8);
        let e1 = queue.next_epoch();
        let e2 = queue.next_epoch();
        assert!(e1 < e2);
    }

    #[test]
    fn publish_and_drain_fifo() {
        let queue = EventQueue::new(8);
        queue.publish(event_types::PUSH, data_types::GITHUB, ctx("u1"));
        queue.publish(event_types::MESSAGE, data_types::SLACK, ctx("u2"));
        queue.publish(event_types::REGENERATE, data_types::AI, ctx("u3"));

        let events = queue.drain(2);
        assert_eq!(events.len(), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(events[0].event_type, event_types::PUSH);
        assert_eq!(events[1].user_id(), Some("u2"));
    }

    #[test]
    fn full_queue_drops_oldest() {
        let queue = EventQueue::new(2);
        queue.publish(event_types::PUSH, data_types::GITHUB, ctx("u1"));
        queue.publish(event_types::PUSH, data_types::GITHUB, ctx("u2"));
        queue.publish(event_types::PUSH, data_types::GITHUB, ctx("u3"));

        let users: Vec<_> = queue
            .drain(10)
            .iter()
            .filter_map(|event| event.user_id().map(str::to_string))
            .collect();
        assert_eq!(users, vec!["u2", "u3"]);
    }

    #[test]
    fn clear_queue() {
        let queue = EventQueue::new(8);
        queue.publish(event_types::PUSH, data_types::GITHUB, ctx("u1"));
        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn event_queue_recovers_from_poisoned_lock() {
        let queue = EventQueue::new(8);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = queue.queue.lock().expect("queue lock should be acquired");
            panic!("poison queue lock");
        }));

        queue.publish(event_types::PUSH, data_types::GITHUB, ctx("u1"));
        assert_eq!(queue.len(), 1);
    }
}
