//! Observability for Strand: tracing subscriber and OpenTelemetry setup.

pub mod tracing_setup;
