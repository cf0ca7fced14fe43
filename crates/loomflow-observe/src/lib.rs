//! Observability for Loomflow.
//!
//! Tracing subscriber setup: fmt + EnvFilter, with optional OpenTelemetry
//! stdout span export for host processes embedding the engine.

pub mod tracing_setup;
