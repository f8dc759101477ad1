//! Wire types for the devpulse cache HTTP surface.
//!
//! Request types keep every identifier optional so the server can answer a
//! missing parameter with a descriptive `400` instead of a generic
//! deserialization failure. The server converts them into its own
//! validated request types before touching the store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Free-form identifiers attached to a domain event or change notification.
pub type ContextMap = BTreeMap<String, String>;

/// Query string accepted by `GET /api/cache`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CacheEntryQuery {
    pub key: Option<String>,
    pub pattern: Option<String>,
    /// Maximum number of keys returned for a pattern lookup.
    pub limit: Option<usize>,
}

/// Query string accepted by `DELETE /api/cache`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CacheDeleteQuery {
    pub key: Option<String>,
    pub pattern: Option<String>,
    pub tag: Option<String>,
}

/// Body of `POST /api/cache`, dispatched on the `action` field.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "action", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum CacheAction {
    Set {
        key: Option<String>,
        value: Option<Value>,
        ttl: Option<u64>,
        #[serde(default)]
        tags: Vec<String>,
    },
    Expire {
        key: Option<String>,
        ttl: Option<u64>,
    },
    FlushNamespace {
        /// Category to flush; absent flushes everything the application owns.
        category: Option<String>,
    },
    WarmCache {
        user_id: Option<String>,
        provider: Option<String>,
    },
    InvalidateUser {
        user_id: Option<String>,
    },
    InvalidateGithub {
        user_id: Option<String>,
        repository: Option<String>,
    },
    InvalidateSlack {
        user_id: Option<String>,
        channel: Option<String>,
    },
    SmartInvalidation {
        change_type: Option<String>,
        user_id: Option<String>,
        #[serde(default)]
        context: ContextMap,
    },
    TriggerEvent {
        event_type: Option<String>,
        data_type: Option<String>,
        #[serde(default)]
        context: ContextMap,
        /// Queue the event for the background consumer instead of firing inline.
        #[serde(default)]
        deferred: bool,
    },
    BatchInvalidation {
        operations: Option<Vec<InvalidationOp>>,
    },
}

/// One invalidation request as it appears on the wire.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum InvalidationOp {
    User {
        user_id: Option<String>,
    },
    Github {
        user_id: Option<String>,
        repository: Option<String>,
    },
    Slack {
        user_id: Option<String>,
        channel: Option<String>,
    },
    Ai {
        user_id: Option<String>,
        date: Option<String>,
    },
    Api {
        endpoint: Option<String>,
        #[serde(default)]
        params: Vec<String>,
    },
    Pattern {
        pattern: Option<String>,
    },
    Smart {
        change_type: Option<String>,
        user_id: Option<String>,
        #[serde(default)]
        context: ContextMap,
    },
    Realtime {
        update_type: Option<String>,
        user_id: Option<String>,
        resource_id: Option<String>,
    },
    Batch {
        #[serde(default)]
        operations: Vec<InvalidationOp>,
    },
}

/// Body of `POST /api/preload`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "action", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum PreloadRequest {
    Intelligent {
        user_id: Option<String>,
        navigation_patterns: Option<Vec<NavigationPattern>>,
    },
    TimeBased {
        user_id: Option<String>,
        time_based_paths: Option<Vec<String>>,
    },
    Critical {
        user_id: Option<String>,
    },
    ProviderSpecific {
        user_id: Option<String>,
        provider: Option<String>,
    },
}

/// An observed navigation path and how often it was visited.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NavigationPattern {
    pub path: String,
    #[serde(default = "default_frequency")]
    pub frequency: u32,
}

fn default_frequency() -> u32 {
    1
}

/// Generic success payload for cache mutations.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalidated_entries: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ActionResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn invalidated(count: u64) -> Self {
        Self {
            success: true,
            invalidated_entries: Some(count),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Response of `GET /api/cache`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CacheEntryResponse {
    Entry {
        key: String,
        value: Option<Value>,
        /// Seconds remaining, `-1` for no expiry, `0` when absent.
        ttl: i64,
    },
    Keys {
        pattern: String,
        keys: Vec<String>,
    },
}

/// Per-operation failure inside a batch invalidation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchFailure {
    pub index: usize,
    pub error: String,
}

/// Aggregate outcome of a batch invalidation.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BatchReport {
    pub invalidated_entries: u64,
    pub succeeded: usize,
    pub failed: Vec<BatchFailure>,
}

/// Outcome of firing one domain event through the trigger registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FireReport {
    pub matched_triggers: usize,
    pub succeeded_actions: usize,
    pub failed_actions: usize,
    pub invalidated_entries: u64,
}

/// Outcome of one warming call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct WarmReport {
    pub warmed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Body returned by `GET /api/cache/health`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub store: StoreHealth,
    pub checks: OperationChecks,
    pub namespaces: BTreeMap<String, u64>,
    pub triggers: TriggerStatus,
    pub stats: StatsReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreHealth {
    pub backend: String,
    pub reachable: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct OperationChecks {
    pub set: bool,
    pub get: bool,
    pub ttl: bool,
    pub delete: bool,
}

impl OperationChecks {
    pub fn all_passed(&self) -> bool {
        self.set && self.get && self.ttl && self.delete
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TriggerStatus {
    pub total: usize,
    pub enabled: usize,
    pub queued_events: usize,
}

/// Counters exposed by `GET /api/cache/stats`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StatsReport {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub invalidated: u64,
    pub errors: u64,
    pub hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_action_reads_camel_case_fields() {
        let action: CacheAction = serde_json::from_str(
            r#"{"action":"invalidate_github","userId":"u1","repository":"acme/api"}"#,
        )
        .expect("valid action");

        match action {
            CacheAction::InvalidateGithub {
                user_id,
                repository,
            } => {
                assert_eq!(user_id.as_deref(), Some("u1"));
                assert_eq!(repository.as_deref(), Some("acme/api"));
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn missing_identifier_still_parses() {
        let action: CacheAction =
            serde_json::from_str(r#"{"action":"invalidate_user"}"#).expect("valid action");
        assert!(matches!(action, CacheAction::InvalidateUser { user_id: None }));
    }

    #[test]
    fn preload_actions_use_kebab_case() {
        let request: PreloadRequest = serde_json::from_str(
            r#"{"action":"time-based","userId":"u1","timeBasedPaths":["/dashboard"]}"#,
        )
        .expect("valid preload");
        assert!(matches!(request, PreloadRequest::TimeBased { .. }));
    }

    #[test]
    fn navigation_frequency_defaults_to_one() {
        let pattern: NavigationPattern =
            serde_json::from_str(r#"{"path":"/github"}"#).expect("valid pattern");
        assert_eq!(pattern.frequency, 1);
    }

    #[test]
    fn action_response_skips_empty_fields() {
        let json = serde_json::to_value(ActionResponse::invalidated(3)).expect("serializable");
        assert_eq!(json["success"], true);
        assert_eq!(json["invalidated_entries"], 3);
        assert!(json.get("message").is_none());
    }
}
