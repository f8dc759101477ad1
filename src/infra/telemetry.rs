use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "devpulse_cache_hit_total",
            Unit::Count,
            "Total number of keyed store reads that found a value."
        );
        describe_counter!(
            "devpulse_cache_miss_total",
            Unit::Count,
            "Total number of keyed store reads that found nothing or failed."
        );
        describe_counter!(
            "devpulse_cache_invalidated_total",
            Unit::Count,
            "Total number of keys removed by invalidation."
        );
        describe_counter!(
            "devpulse_cache_store_error_total",
            Unit::Count,
            "Total number of store operations degraded to a miss or no-op."
        );
        describe_counter!(
            "devpulse_cache_warm_total",
            Unit::Count,
            "Total number of warming attempts by mode and outcome."
        );
        describe_counter!(
            "devpulse_cache_trigger_action_total",
            Unit::Count,
            "Total number of trigger actions executed by result."
        );
        describe_gauge!(
            "devpulse_cache_event_queue_len",
            Unit::Count,
            "Current number of pending domain events in the queue."
        );
        describe_counter!(
            "devpulse_cache_event_dropped_total",
            Unit::Count,
            "Total number of domain events dropped due to queue overflow."
        );
        describe_histogram!(
            "devpulse_cache_consume_ms",
            Unit::Milliseconds,
            "Event consumption latency in milliseconds."
        );
        describe_counter!(
            "devpulse_client_cache_evict_total",
            Unit::Count,
            "Total number of client response-cache evictions due to capacity."
        );
        describe_counter!(
            "devpulse_client_cache_write_skipped_total",
            Unit::Count,
            "Total number of client response-cache writes skipped by reason."
        );
    });
}
