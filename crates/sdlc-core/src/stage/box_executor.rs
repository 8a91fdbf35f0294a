//! BoxStageExecutor -- object-safe dynamic dispatch wrapper for StageExecutor.
//!
//! 1. Define an object-safe `StageExecutorDyn` trait with boxed futures
//! 2. Blanket-impl `StageExecutorDyn` for all `T: StageExecutor`
//! 3. `BoxStageExecutor` wraps `Box<dyn StageExecutorDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use sdlc_types::error::StageError;
use sdlc_types::workflow::{StageOutcome, WorkflowState};

use super::executor::StageExecutor;

/// Object-safe version of [`StageExecutor`] with boxed futures.
pub trait StageExecutorDyn: Send + Sync {
    fn name(&self) -> &str;

    fn execute_boxed<'a>(
        &'a self,
        state: &'a WorkflowState,
    ) -> Pin<Box<dyn Future<Output = Result<StageOutcome, StageError>> + Send + 'a>>;
}

impl<T: StageExecutor> StageExecutorDyn for T {
    fn name(&self) -> &str {
        StageExecutor::name(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        state: &'a WorkflowState,
    ) -> Pin<Box<dyn Future<Output = Result<StageOutcome, StageError>> + Send + 'a>> {
        Box::pin(self.execute(state))
    }
}

/// Type-erased stage executor, so one registry can hold placeholder,
/// external-command and test executors side by side.
///
/// Since `StageExecutor` uses RPITIT, it cannot be used as a trait object
/// directly. `BoxStageExecutor` delegates to the inner `StageExecutorDyn`.
pub struct BoxStageExecutor {
    inner: Box<dyn StageExecutorDyn + Send + Sync>,
}

impl BoxStageExecutor {
    pub fn new<T: StageExecutor + 'static>(executor: T) -> Self {
        Self {
            inner: Box::new(executor),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn execute(&self, state: &WorkflowState) -> Result<StageOutcome, StageError> {
        self.inner.execute_boxed(state).await
    }
}

impl std::fmt::Debug for BoxStageExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStageExecutor")
            .field("name", &self.name())
            .finish()
    }
}
