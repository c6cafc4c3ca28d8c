//! Observability setup for Nodeflow: tracing subscriber and optional
//! OpenTelemetry export.

pub mod tracing_setup;
