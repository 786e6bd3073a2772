use orderflow_core::TaskId;

use super::broker::Broker;
use super::types::{PipelineCursor, TaskMessage};

/// Per-execution information handed to a task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: TaskId,
    name: String,
    attempt: u32,
    pipeline: Option<PipelineCursor>,
    broker: Broker,
}

impl TaskContext {
    pub(crate) fn for_message(message: &TaskMessage, broker: Broker) -> Self {
        Self {
            task_id: message.id,
            name: message.name.clone(),
            attempt: message.attempts,
            pipeline: message.pipeline.clone(),
            broker,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Retries performed before this execution (0 on first delivery).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn pipeline(&self) -> Option<&PipelineCursor> {
        self.pipeline.as_ref()
    }

    /// Broker for submitting follow-up work from inside a task.
    pub fn broker(&self) -> &Broker {
        &self.broker
    }
}
