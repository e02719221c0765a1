use super::{Echo, FlTask, TaskContext};
use crate::errors::RegistryError;
use fedrun_common::Run;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Builds a handler for one step execution.
pub type TaskFactory = Arc<dyn Fn(TaskContext) -> Box<dyn FlTask> + Send + Sync>;

/// Model identifier to handler factory, populated at start-up.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    factories: BTreeMap<String, TaskFactory>,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("models", &self.models())
            .finish()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the built-in models.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Echo::MODEL, |ctx| Box::new(Echo::new(ctx)));
        registry
    }

    /// Register (or replace) the factory for `model`.
    pub fn register<F>(&mut self, model: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(TaskContext) -> Box<dyn FlTask> + Send + Sync + 'static,
    {
        self.factories.insert(model.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, model: &str) -> bool {
        self.factories.contains_key(model)
    }

    pub fn models(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Build the handler for the run's active step.
    pub fn instantiate(
        &self,
        run: &Run,
        ctx: TaskContext,
    ) -> Result<Box<dyn FlTask>, RegistryError> {
        let model = run.model().ok_or_else(|| RegistryError::NoActiveStep {
            run_id: run.id.clone(),
            cur_seq: run.cur_seq,
            task_count: run.tasks.len(),
        })?;
        let factory = self
            .factories
            .get(model)
            .ok_or_else(|| RegistryError::UnknownModel {
                model: model.to_string(),
                known: self.models().join(", "),
            })?;
        Ok(factory(ctx))
    }
}
