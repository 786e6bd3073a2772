//! Explicit multi-step task pipelines.
//!
//! A pipeline is an ordered list of registered task names. Starting a run
//! enqueues step 0; when step `k` succeeds, its output becomes the arguments
//! of step `k + 1`, and that continuation is written in the same storage
//! transaction that marks step `k` succeeded. A crash can therefore neither
//! lose the next step nor enqueue it twice.
//!
//! Each step commits its own side effects. A failing later step does not
//! undo earlier ones.

use crate::jobs::{PipelineCursor, Task};

/// Ordered sequence of task names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    name: String,
    steps: Vec<&'static str>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step; its arguments are the previous step's output.
    pub fn step<T: Task>(mut self) -> Self {
        self.steps.push(T::NAME);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[&'static str] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn first_step(&self) -> Option<&'static str> {
        self.steps.first().copied()
    }

    /// The step following the one `cursor` points at, if any.
    pub fn step_after(&self, cursor: &PipelineCursor) -> Option<(&'static str, PipelineCursor)> {
        let next = cursor.next();
        self.steps.get(next.step).map(|name| (*name, next))
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::Value as JsonValue;

    use super::*;
    use crate::jobs::{TaskContext, TaskError};

    struct First;
    struct Second;

    #[async_trait]
    impl Task for First {
        const NAME: &'static str = "test.first";
        type Args = JsonValue;
        type Output = JsonValue;

        async fn run(&self, _ctx: TaskContext, args: JsonValue) -> Result<JsonValue, TaskError> {
            Ok(args)
        }
    }

    #[async_trait]
    impl Task for Second {
        const NAME: &'static str = "test.second";
        type Args = JsonValue;
        type Output = JsonValue;

        async fn run(&self, _ctx: TaskContext, args: JsonValue) -> Result<JsonValue, TaskError> {
            Ok(args)
        }
    }

    #[test]
    fn steps_are_kept_in_order() {
        let pipeline = Pipeline::new("test.flow").step::<First>().step::<Second>();

        assert_eq!(pipeline.name(), "test.flow");
        assert_eq!(pipeline.steps(), &["test.first", "test.second"]);
        assert_eq!(pipeline.first_step(), Some("test.first"));
    }

    #[test]
    fn step_after_advances_cursor_within_run() {
        let pipeline = Pipeline::new("test.flow").step::<First>().step::<Second>();
        let start = PipelineCursor::start("test.flow");

        let (name, cursor) = pipeline.step_after(&start).unwrap();
        assert_eq!(name, "test.second");
        assert_eq!(cursor.step, 1);
        assert_eq!(cursor.run_id, start.run_id);

        assert!(pipeline.step_after(&cursor).is_none());
    }
}
