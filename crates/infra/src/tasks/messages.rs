use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::jobs::{RetryPolicy, Task, TaskContext, TaskError};

const MAX_REPEAT: u32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatArgs {
    pub message: String,
    #[serde(default = "default_repeat")]
    pub repeat: u32,
}

fn default_repeat() -> u32 {
    1
}

/// Produces `message_0 .. message_{repeat-1}`.
pub struct RepeatMessage;

#[async_trait]
impl Task for RepeatMessage {
    const NAME: &'static str = "message.repeat";
    type Args = RepeatArgs;
    type Output = Vec<String>;

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(3, Duration::from_secs(1))
    }

    fn validate(&self, args: &RepeatArgs) -> Result<(), TaskError> {
        if args.repeat > MAX_REPEAT {
            return Err(TaskError::invalid_arguments(format!(
                "repeat must be at most {MAX_REPEAT}, got {}",
                args.repeat
            )));
        }
        Ok(())
    }

    async fn run(&self, _ctx: TaskContext, args: RepeatArgs) -> Result<Vec<String>, TaskError> {
        let out: Vec<String> = (0..args.repeat)
            .map(|i| format!("{}_{i}", args.message))
            .collect();
        debug!(count = out.len(), "message repeated");
        Ok(out)
    }
}
