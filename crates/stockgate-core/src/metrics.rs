//! OTLP export for traces and tunnel metrics.
//!
//! Compiled only with the `metrics` feature.

use opentelemetry::metrics::{Counter, Gauge};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("OTLP exporter: {0}")]
    Exporter(#[from] opentelemetry_otlp::ExporterBuildError),

    #[error("OpenTelemetry shutdown: {0}")]
    Shutdown(#[from] opentelemetry_sdk::error::OTelSdkError),
}

/// Owns the installed providers. Dropping it does not flush; call
/// [`MetricsGuard::shutdown`] before exit.
pub struct MetricsGuard {
    traces: SdkTracerProvider,
    meters: SdkMeterProvider,
}

impl MetricsGuard {
    pub const fn tracer_provider(&self) -> &SdkTracerProvider {
        &self.traces
    }

    /// Flush and stop both providers.
    ///
    /// # Errors
    ///
    /// Returns the first provider shutdown failure.
    pub fn shutdown(self) -> Result<(), MetricsError> {
        self.traces.shutdown()?;
        self.meters.shutdown()?;
        Ok(())
    }
}

/// Install global trace and meter providers exporting over gRPC to `endpoint`.
///
/// # Errors
///
/// Returns [`MetricsError::Exporter`] if an exporter cannot be built.
pub fn init_metrics(endpoint: &str) -> Result<MetricsGuard, MetricsError> {
    let spans = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    let traces = SdkTracerProvider::builder()
        .with_batch_exporter(spans)
        .build();
    global::set_tracer_provider(traces.clone());

    let readings = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    let meters = SdkMeterProvider::builder()
        .with_periodic_exporter(readings)
        .build();
    global::set_meter_provider(meters.clone());

    Ok(MetricsGuard { traces, meters })
}

/// Instruments describing the database tunnel.
pub struct TunnelMetrics {
    transitions: Counter<u64>,
    failures: Counter<u64>,
    epoch: Gauge<u64>,
    active_sessions: Gauge<u64>,
    bytes: Counter<u64>,
}

impl TunnelMetrics {
    /// Create the instruments on the global meter provider.
    pub fn new() -> Self {
        let meter = global::meter("stockgate");
        Self {
            transitions: meter
                .u64_counter("stockgate.tunnel.transitions")
                .with_description("Tunnel state transitions")
                .build(),
            failures: meter
                .u64_counter("stockgate.tunnel.failures")
                .with_description("Failed connection attempts and lost transports")
                .build(),
            epoch: meter
                .u64_gauge("stockgate.tunnel.epoch")
                .with_description("Current ready epoch")
                .build(),
            active_sessions: meter
                .u64_gauge("stockgate.bridge.active_sessions")
                .with_description("Live bridge sessions")
                .build(),
            bytes: meter
                .u64_counter("stockgate.bridge.bytes")
                .with_description("Bytes relayed through the bridge")
                .with_unit("By")
                .build(),
        }
    }

    pub fn record_transition(&self, state: &'static str, epoch: u64) {
        self.transitions.add(1, &[KeyValue::new("state", state)]);
        self.epoch.record(epoch, &[]);
    }

    pub fn record_failure(&self, kind: &'static str) {
        self.failures.add(1, &[KeyValue::new("kind", kind)]);
    }

    pub fn record_bridge(&self, active_sessions: u64, to_remote: u64, from_remote: u64) {
        self.active_sessions.record(active_sessions, &[]);
        self.bytes.add(to_remote, &[KeyValue::new("direction", "to_remote")]);
        self.bytes
            .add(from_remote, &[KeyValue::new("direction", "from_remote")]);
    }
}

impl Default for TunnelMetrics {
    fn default() -> Self {
        Self::new()
    }
}
