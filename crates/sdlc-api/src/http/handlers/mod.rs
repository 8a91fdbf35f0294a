//! HTTP request handlers.

pub mod workflow;
pub mod ws;
