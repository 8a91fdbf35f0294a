use thiserror::Error;

/// Errors from checkpoint store operations (used by trait definitions in sdlc-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Faults raised by a stage executor that could not produce an outcome.
///
/// The engine never propagates these; it folds them into a failed
/// `StageOutcome` with a synthesized error message.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("stage failed: {0}")]
    Failed(String),

    #[error("stage timed out after {0}s")]
    Timeout(u64),

    #[error("stage panicked: {0}")]
    Panicked(String),
}
