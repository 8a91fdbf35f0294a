//! Stage executor contract, type-erased wrapper and name-indexed registry.

pub mod box_executor;
pub mod executor;
pub mod registry;

pub use box_executor::BoxStageExecutor;
pub use executor::StageExecutor;
pub use registry::ExecutorRegistry;
