//! Workflow orchestration core for the SDLC pipeline.
//!
//! This crate defines the stage executor contract, the stage graph and its
//! branch policy, the checkpoint store port, and the engine that drives
//! workflows through them. It depends only on `sdlc-types` -- never on
//! `sdlc-infra` or any database/IO crate.

pub mod checkpoint;
pub mod engine;
pub mod event;
pub mod graph;
pub mod registry;
pub mod stage;

#[cfg(test)]
mod testing;
