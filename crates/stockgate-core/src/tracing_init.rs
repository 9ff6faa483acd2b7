//! Global tracing subscriber.
//!
//! `RUST_LOG` wins over the default filter. Output is human-readable or one
//! JSON object per line; with the `metrics` feature spans are also exported
//! over OTLP.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Install the subscriber. `default_filter` looks like `"stockgate=info,russh=warn"`.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    tracing_subscriber::registry()
        .with(env_filter(default_filter))
        .with(log_json.then(|| fmt::layer().json()))
        .with((!log_json).then(fmt::layer))
        .init();
}

/// Install the subscriber plus, when `endpoint` is set, the OTLP pipeline.
///
/// An exporter that cannot be built is logged once logging is up; the
/// daemon then runs without export.
#[cfg(feature = "metrics")]
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    endpoint: Option<&str>,
) -> Option<crate::metrics::MetricsGuard> {
    use opentelemetry::trace::TracerProvider as _;

    let Some(endpoint) = endpoint else {
        init_tracing(default_filter, log_json);
        return None;
    };

    let guard = match crate::metrics::init_metrics(endpoint) {
        Ok(guard) => guard,
        Err(e) => {
            init_tracing(default_filter, log_json);
            tracing::warn!(error = %e, endpoint, "OpenTelemetry pipeline disabled");
            return None;
        }
    };

    let tracer = guard.tracer_provider().tracer("stockgate");
    tracing_subscriber::registry()
        .with(env_filter(default_filter))
        .with(log_json.then(|| fmt::layer().json()))
        .with((!log_json).then(fmt::layer))
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .init();
    Some(guard)
}
