//! Task registry: typed task handlers behind a name-keyed, type-erased map.
//!
//! A `Task` declares its name, argument and output types, and a retry
//! policy. Registration wraps it in `TypedTask<T>`, which decodes JSON
//! arguments and encodes the output, so the broker and workers only ever see
//! `Arc<dyn DynTask>`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::pipeline::Pipeline;

use super::context::TaskContext;
use super::types::{RetryPolicy, TaskError};

/// A named unit of background work.
///
/// ```ignore
/// struct RepeatMessage;
///
/// #[async_trait]
/// impl Task for RepeatMessage {
///     const NAME: &'static str = "message.repeat";
///     type Args = RepeatArgs;
///     type Output = RepeatOutput;
///
///     async fn run(&self, ctx: TaskContext, args: RepeatArgs) -> Result<RepeatOutput, TaskError> {
///         Ok(RepeatOutput { message: args.message.repeat(args.times) })
///     }
/// }
/// ```
#[async_trait]
pub trait Task: Send + Sync + 'static {
    /// Routing key, `{domain}.{action}`.
    const NAME: &'static str;

    type Args: Serialize + DeserializeOwned + Send + 'static;
    type Output: Serialize + Send + 'static;

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    /// Reject decoded arguments that are well-formed but unacceptable.
    ///
    /// Runs at submission and again before every execution.
    fn validate(&self, _args: &Self::Args) -> Result<(), TaskError> {
        Ok(())
    }

    async fn run(&self, ctx: TaskContext, args: Self::Args) -> Result<Self::Output, TaskError>;
}

/// Object-safe view of a registered task.
#[async_trait]
pub trait DynTask: Send + Sync {
    fn name(&self) -> &'static str;

    fn retry_policy(&self) -> RetryPolicy;

    /// Check that `args` decode into the task's argument type and pass
    /// [`Task::validate`].
    fn check_args(&self, args: &JsonValue) -> Result<(), TaskError>;

    async fn run_dyn(&self, ctx: TaskContext, args: JsonValue) -> Result<JsonValue, TaskError>;
}

struct TypedTask<T: Task>(T);

impl<T: Task> TypedTask<T> {
    fn decode(&self, args: JsonValue) -> Result<T::Args, TaskError> {
        let args = serde_json::from_value(args)
            .map_err(|e| TaskError::invalid_arguments(format!("{}: {e}", T::NAME)))?;
        self.0.validate(&args)?;
        Ok(args)
    }
}

#[async_trait]
impl<T: Task> DynTask for TypedTask<T> {
    fn name(&self) -> &'static str {
        T::NAME
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.0.retry_policy()
    }

    fn check_args(&self, args: &JsonValue) -> Result<(), TaskError> {
        self.decode(args.clone()).map(|_| ())
    }

    async fn run_dyn(&self, ctx: TaskContext, args: JsonValue) -> Result<JsonValue, TaskError> {
        let args = self.decode(args)?;
        let output = self.0.run(ctx, args).await?;
        serde_json::to_value(output)
            .map_err(|e| TaskError::rejected(format!("{}: unserializable output: {e}", T::NAME)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("task '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("pipeline '{0}' is already registered")]
    PipelineAlreadyRegistered(String),

    #[error("pipeline '{0}' has no steps")]
    EmptyPipeline(String),

    #[error("pipeline '{pipeline}' uses unregistered task '{task}'")]
    UnknownStep { pipeline: String, task: String },
}

/// Name-keyed registry of tasks and pipelines.
///
/// Built once at startup, then shared read-only behind an `Arc`.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<&'static str, Arc<dyn DynTask>>,
    pipelines: HashMap<String, Pipeline>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Task>(&mut self, task: T) -> Result<(), RegistryError> {
        if self.contains(T::NAME) {
            return Err(RegistryError::AlreadyRegistered(T::NAME.to_string()));
        }
        self.tasks.insert(T::NAME, Arc::new(TypedTask(task)));
        Ok(())
    }

    /// Register a pipeline; every step must already be a registered task.
    pub fn register_pipeline(&mut self, pipeline: Pipeline) -> Result<(), RegistryError> {
        if self.pipelines.contains_key(pipeline.name()) {
            return Err(RegistryError::PipelineAlreadyRegistered(
                pipeline.name().to_string(),
            ));
        }
        if pipeline.is_empty() {
            return Err(RegistryError::EmptyPipeline(pipeline.name().to_string()));
        }
        if let Some(missing) = pipeline
            .steps()
            .iter()
            .find(|step| !self.contains(step))
        {
            return Err(RegistryError::UnknownStep {
                pipeline: pipeline.name().to_string(),
                task: missing.to_string(),
            });
        }

        self.pipelines.insert(pipeline.name().to_string(), pipeline);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DynTask>> {
        self.tasks.get(name).cloned()
    }

    pub fn pipeline(&self, name: &str) -> Option<&Pipeline> {
        self.pipelines.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.tasks.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.task_names())
            .field("pipelines", &self.pipelines.keys().collect::<Vec<_>>())
            .finish()
    }
}
