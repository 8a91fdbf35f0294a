//! Shared domain types for the SDLC workflow orchestrator.
//!
//! This crate contains the domain types used across the workspace:
//! Stage, WorkflowState, StageOutcome, CheckpointRecord, StepEvent, the
//! configuration schema, and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod workflow;
