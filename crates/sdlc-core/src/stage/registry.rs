//! Executor registry for stage dispatch by name.
//!
//! The surrounding application supplies one executor per stage; the engine
//! only ever looks them up here and never constructs executor logic itself.

use std::collections::HashMap;
use std::sync::Arc;

use sdlc_types::workflow::Stage;

use super::box_executor::BoxStageExecutor;
use super::executor::StageExecutor;

/// Registry of stage executors, indexed by stage.
#[derive(Debug, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<Stage, Arc<BoxStageExecutor>>,
}

impl ExecutorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an already boxed executor for `stage`.
    ///
    /// If an executor for this stage already exists, it is replaced.
    pub fn register(&mut self, stage: Stage, executor: BoxStageExecutor) {
        self.executors.insert(stage, Arc::new(executor));
    }

    /// Box and register a concrete executor (builder style).
    pub fn with<T: StageExecutor + 'static>(mut self, stage: Stage, executor: T) -> Self {
        self.register(stage, BoxStageExecutor::new(executor));
        self
    }

    /// Look up the executor for a stage.
    pub fn get(&self, stage: Stage) -> Option<Arc<BoxStageExecutor>> {
        self.executors.get(&stage).cloned()
    }

    /// Registered stages in pipeline order.
    pub fn stages(&self) -> Vec<Stage> {
        let mut stages: Vec<Stage> = self.executors.keys().copied().collect();
        stages.sort();
        stages
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
