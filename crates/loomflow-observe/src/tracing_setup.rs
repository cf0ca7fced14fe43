//! Tracing subscriber installation for engine host processes.
//!
//! Hosts call [`init_tracing`] once at startup. Structured fmt output is
//! always on; span export to OpenTelemetry is opt-in and writes to stdout,
//! which is enough for local debugging of run and step span timings. Swap
//! the exporter for OTLP when wiring a real collector.

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Held for the life of the process so spans can be flushed at shutdown.
static SPAN_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Install the global subscriber. Filtering follows `RUST_LOG`, defaulting
/// to `info` when unset.
///
/// Fails if a global subscriber is already installed, so embedded hosts can
/// call it unconditionally and ignore the error.
pub fn init_tracing(export_spans: bool) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE);
    let base = tracing_subscriber::registry().with(filter).with(fmt_layer);

    if export_spans {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("loomflow-engine");
        let _ = SPAN_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);
        base.with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()?;
    } else {
        base.try_init()?;
    }
    Ok(())
}

/// Flush and stop the span exporter. A no-op when spans were never exported.
pub fn shutdown_tracing() {
    if let Some(provider) = SPAN_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error = %e, "span exporter shutdown failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
