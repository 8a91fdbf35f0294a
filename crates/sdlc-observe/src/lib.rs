//! Observability setup for the SDLC orchestrator: tracing subscriber with
//! optional OpenTelemetry export.

pub mod tracing_setup;
