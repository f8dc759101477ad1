//! devpulse server-side cache engine.
//!
//! - **Store**: keyed JSON values with per-key TTL, tag indexes and
//!   batched pattern deletion, over Redis or an in-process backend
//! - **Triggers**: declarative rules mapping domain events to invalidations,
//!   fired inline or queued and consumed in merged batches
//! - **Warming**: set-if-absent population of likely-needed keys
//!
//! ## Configuration
//!
//! ```toml
//! [store]
//! redis_url = "redis://127.0.0.1:6379"
//! namespace = "devpulse"
//!
//! [cache]
//! auto_consume_interval_ms = 5000
//! # ... see config.rs for all options
//! ```

mod backend;
mod config;
mod consumer;
mod engine;
mod events;
mod glob;
mod health;
mod invalidation;
mod keys;
mod lock;
mod planner;
mod redis;
mod service;
mod stats;
mod store;
mod trigger;
mod warming;

pub use backend::{MemoryBackend, StoreBackend, StoreError, TTL_ABSENT, TTL_PERSISTENT};
pub use config::{CacheConfig, TtlPolicy};
pub use consumer::{ConsumeReport, EventConsumer};
pub use engine::TriggerEngine;
pub use events::{
    DomainEvent, Epoch, EventContext, EventQueue, context_keys, data_types, event_types,
};
pub use health::HealthReporter;
pub use invalidation::{
    ChangeType, InvalidationError, InvalidationRequest, InvalidationService, UpdateType, required,
};
pub use keys::{Category, DELIMITER, KeyError, KeySpace, Provider, Subtree, escape_glob};
pub use planner::{ConsumptionPlan, PlanFailure};
pub use self::redis::{RedisBackend, sanitize_url};
pub use service::{CacheEngine, CacheInitError};
pub use stats::CacheStats;
pub use store::KeyedStore;
pub use trigger::{
    InvalidationTrigger, InvalidationType, ResolvedAction, TriggerAction, TriggerConditions,
    TriggerError, TriggerRegistry,
};
pub use warming::{
    CacheWarmer, DisabledWarmLoader, HttpWarmLoader, WarmError, WarmLoader, WarmTarget,
    WarmingConfig, paths_for_hour, rank_paths,
};
