//! Stage executor trait definition.
//!
//! A stage executor performs one stage's domain work. It receives the
//! accumulated workflow state read-only and returns a `StageOutcome` delta
//! that the engine merges. Executors may be invoked again for the same stage
//! on retry, so they must be idempotent with respect to the engine.

use sdlc_types::error::StageError;
use sdlc_types::workflow::{StageOutcome, WorkflowState};

/// Capability every stage implementation satisfies.
///
/// Domain failures are reported as `Ok(StageOutcome { success: false, .. })`.
/// `Err(StageError)` is reserved for faults where no outcome could be
/// produced at all; the engine folds those into a failed outcome as well.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait StageExecutor: Send + Sync {
    /// Short name for logs (e.g. "placeholder", "command").
    fn name(&self) -> &str;

    /// Run the stage against the current state.
    fn execute(
        &self,
        state: &WorkflowState,
    ) -> impl std::future::Future<Output = Result<StageOutcome, StageError>> + Send;
}
