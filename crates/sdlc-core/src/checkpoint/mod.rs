//! Checkpoint persistence port and its in-memory implementation.

pub mod memory;
pub mod store;

pub use memory::InMemoryCheckpointStore;
pub use store::CheckpointStore;
