//! Per-workflow step event fan-out.
//!
//! Provides an `EventBus` that distributes `StepEvent` messages to all
//! subscribers via a `tokio::sync::broadcast` channel.

pub mod bus;

pub use bus::EventBus;
