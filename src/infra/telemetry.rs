use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
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
            "webshot_cache_hit_total",
            Unit::Count,
            "Snapshot requests answered from an existing artifact."
        );
        describe_counter!(
            "webshot_cache_miss_total",
            Unit::Count,
            "Snapshot requests that required a render (missing artifact or flush)."
        );
        describe_counter!(
            "webshot_render_total",
            Unit::Count,
            "Renderer invocations, successful or not."
        );
        describe_counter!(
            "webshot_render_failure_total",
            Unit::Count,
            "Renderer invocations that did not produce an artifact, by reason."
        );
        describe_histogram!(
            "webshot_render_ms",
            Unit::Milliseconds,
            "Wall-clock time spent in the renderer in milliseconds."
        );
    });
}
