//! HTTP/WebSocket front door.
//!
//! Axum-based JSON API over the engine registry with CORS and request
//! tracing. Workflow progress is pushed over `/ws/{id}`.

pub mod error;
pub mod handlers;
pub mod router;
