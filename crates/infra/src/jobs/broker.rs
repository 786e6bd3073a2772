//! Broker: the single entry point for submitting and finalizing tasks.
//!
//! Submission validates against the registry before anything is stored, so
//! callers learn about unknown names and malformed arguments immediately.
//! Workers claim through the broker and report back via `complete`, `retry`
//! or `fail`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use orderflow_core::TaskId;

use super::registry::{Task, TaskRegistry};
use super::store::{QueueError, QueueStats, TaskQueue};
use super::types::{PipelineCursor, TaskError, TaskMessage, TaskStatus};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BrokerError {
    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error("unknown pipeline '{0}'")]
    UnknownPipeline(String),

    #[error("invalid arguments for '{task}': {reason}")]
    InvalidArguments { task: String, reason: String },

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl BrokerError {
    /// Storage was briefly unavailable; the same call may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Queue(e) if e.is_transient())
    }
}

/// Queue front-end shared by callers, workers and running tasks.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct Broker {
    queue: Arc<dyn TaskQueue>,
    registry: Arc<TaskRegistry>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Broker {
    pub fn new(queue: Arc<dyn TaskQueue>, registry: Arc<TaskRegistry>) -> Self {
        Self { queue, registry }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Validate and enqueue a task by name. Returns without waiting for
    /// execution.
    #[instrument(skip(self, name, args), fields(task = %name, task_id), err)]
    pub async fn submit(&self, name: &str, args: JsonValue) -> Result<TaskId, BrokerError> {
        let message = self.prepare(name, args)?;
        let id = self.queue.enqueue(message).await?;

        tracing::Span::current().record("task_id", tracing::field::display(id));
        debug!("task submitted");
        Ok(id)
    }

    /// Typed convenience over [`Broker::submit`].
    pub async fn submit_task<T: Task>(&self, args: &T::Args) -> Result<TaskId, BrokerError> {
        let args = serde_json::to_value(args).map_err(|e| BrokerError::InvalidArguments {
            task: T::NAME.to_string(),
            reason: e.to_string(),
        })?;
        self.submit(T::NAME, args).await
    }

    /// Submit step 0 of a registered pipeline under a fresh run id.
    #[instrument(skip(self, name, args), fields(pipeline = %name), err)]
    pub async fn start_pipeline(&self, name: &str, args: JsonValue) -> Result<TaskId, BrokerError> {
        let pipeline = self
            .registry
            .pipeline(name)
            .ok_or_else(|| BrokerError::UnknownPipeline(name.to_string()))?;
        let first = pipeline
            .first_step()
            .ok_or_else(|| BrokerError::UnknownPipeline(name.to_string()))?;

        let cursor = PipelineCursor::start(name);
        let run_id = cursor.run_id;
        let message = self.prepare(first, args)?.in_pipeline(cursor);
        let id = self.queue.enqueue(message).await?;

        info!(%run_id, task_id = %id, "pipeline started");
        Ok(id)
    }

    /// Claim the next ready message, if any.
    pub async fn claim(&self) -> Result<Option<TaskMessage>, BrokerError> {
        Ok(self.queue.claim_next().await?)
    }

    /// Mark a running message succeeded.
    pub async fn ack(&self, id: TaskId) -> Result<(), BrokerError> {
        self.complete(id, JsonValue::Null, None).await
    }

    /// Mark a running message succeeded and enqueue `continuation` with it,
    /// atomically.
    pub async fn complete(
        &self,
        id: TaskId,
        result: JsonValue,
        continuation: Option<TaskMessage>,
    ) -> Result<(), BrokerError> {
        Ok(self.queue.complete(id, result, continuation).await?)
    }

    /// Apply the message's retry policy to a failed execution.
    pub async fn retry(&self, id: TaskId, error: &str) -> Result<TaskStatus, BrokerError> {
        let message = self.queue.retry(id, error.to_string()).await?;

        match message.status {
            TaskStatus::FailedRetryable => warn!(
                task_id = %id,
                task = %message.name,
                attempt = message.attempts,
                max_retries = message.retry_policy.max_retries,
                available_at = %message.available_at,
                error,
                "task failed, retry scheduled"
            ),
            _ => error!(
                task_id = %id,
                task = %message.name,
                attempts = message.attempts,
                error,
                "task failed, retries exhausted"
            ),
        }
        Ok(message.status)
    }

    /// Fail a running message without retrying.
    pub async fn fail(&self, id: TaskId, error: &str) -> Result<(), BrokerError> {
        let message = self.queue.fail(id, error.to_string()).await?;
        error!(task_id = %id, task = %message.name, error, "task failed terminally");
        Ok(())
    }

    /// Hand a running message back to the queue without counting an attempt.
    pub async fn requeue(&self, id: TaskId) -> Result<(), BrokerError> {
        self.queue.requeue(id).await?;
        warn!(task_id = %id, "task returned to the queue");
        Ok(())
    }

    pub async fn task(&self, id: TaskId) -> Result<Option<TaskMessage>, BrokerError> {
        Ok(self.queue.get(id).await?)
    }

    /// Terminally failed messages, most recent first. They are kept for
    /// inspection and never redelivered.
    pub async fn failed_tasks(&self, limit: usize) -> Result<Vec<TaskMessage>, BrokerError> {
        Ok(self.queue.list_failed(limit).await?)
    }

    pub async fn stats(&self) -> Result<QueueStats, BrokerError> {
        Ok(self.queue.stats().await?)
    }

    /// Requeue messages left running by a previous process.
    #[instrument(skip(self), err)]
    pub async fn recover_orphaned(&self) -> Result<usize, BrokerError> {
        let requeued = self.queue.requeue_running().await?;
        if requeued > 0 {
            warn!(requeued, "requeued orphaned tasks");
        }
        Ok(requeued)
    }

    /// Delete finished messages last updated before `before`.
    #[instrument(skip(self), err)]
    pub async fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize, BrokerError> {
        let purged = self.queue.purge_finished(before).await?;
        if purged > 0 {
            info!(purged, "purged finished tasks");
        }
        Ok(purged)
    }

    /// Build the message for the pipeline step after `message`, using
    /// `result` as its arguments.
    ///
    /// Returns `Ok(None)` when `message` is not a pipeline step or is the
    /// last one.
    pub(crate) fn continuation(
        &self,
        message: &TaskMessage,
        result: &JsonValue,
    ) -> Result<Option<TaskMessage>, TaskError> {
        let Some(cursor) = &message.pipeline else {
            return Ok(None);
        };
        let pipeline = self.registry.pipeline(&cursor.pipeline).ok_or_else(|| {
            TaskError::rejected(format!("unknown pipeline '{}'", cursor.pipeline))
        })?;
        let Some((next, next_cursor)) = pipeline.step_after(cursor) else {
            return Ok(None);
        };

        let message = self
            .prepare(next, result.clone())
            .map_err(|e| TaskError::invalid_arguments(e.to_string()))?;
        Ok(Some(message.in_pipeline(next_cursor)))
    }

    fn prepare(&self, name: &str, args: JsonValue) -> Result<TaskMessage, BrokerError> {
        if !args.is_object() {
            return Err(BrokerError::InvalidArguments {
                task: name.to_string(),
                reason: "arguments must be a JSON object".to_string(),
            });
        }

        let task = self
            .registry
            .get(name)
            .ok_or_else(|| BrokerError::UnknownTask(name.to_string()))?;
        task.check_args(&args)
            .map_err(|e| BrokerError::InvalidArguments {
                task: name.to_string(),
                reason: e.to_string(),
            })?;

        Ok(TaskMessage::new(name, args, task.retry_policy()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::jobs::{InMemoryTaskQueue, RetryPolicy, TaskContext};
    use crate::pipeline::Pipeline;

    #[derive(Debug, Serialize, Deserialize)]
    struct CountArgs {
        n: u32,
    }

    struct Increment;

    #[async_trait]
    impl Task for Increment {
        const NAME: &'static str = "test.increment";
        type Args = CountArgs;
        type Output = CountArgs;

        fn retry_policy(&self) -> RetryPolicy {
            RetryPolicy::fixed(1, Duration::ZERO)
        }

        fn validate(&self, args: &CountArgs) -> Result<(), TaskError> {
            if args.n > 1000 {
                return Err(TaskError::invalid_arguments("n must be at most 1000"));
            }
            Ok(())
        }

        async fn run(&self, _ctx: TaskContext, args: CountArgs) -> Result<CountArgs, TaskError> {
            Ok(CountArgs { n: args.n + 1 })
        }
    }

    fn broker() -> Broker {
        let mut registry = TaskRegistry::new();
        registry.register(Increment).unwrap();
        registry
            .register_pipeline(
                Pipeline::new("test.twice")
                    .step::<Increment>()
                    .step::<Increment>(),
            )
            .unwrap();
        Broker::new(InMemoryTaskQueue::arc(), Arc::new(registry))
    }

    #[tokio::test]
    async fn submit_snapshots_retry_policy() {
        let broker = broker();
        let id = broker.submit_task::<Increment>(&CountArgs { n: 1 }).await.unwrap();

        let msg = broker.task(id).await.unwrap().unwrap();
        assert_eq!(msg.name, "test.increment");
        assert_eq!(msg.status, TaskStatus::Queued);
        assert_eq!(msg.attempts, 0);
        assert_eq!(msg.retry_policy, RetryPolicy::fixed(1, Duration::ZERO));
        assert!(msg.pipeline.is_none());
    }

    #[tokio::test]
    async fn submit_rejects_bad_input_immediately() {
        let broker = broker();

        assert_eq!(
            broker.submit("test.missing", serde_json::json!({})).await,
            Err(BrokerError::UnknownTask("test.missing".to_string()))
        );
        assert!(matches!(
            broker.submit("test.increment", serde_json::json!([1, 2])).await,
            Err(BrokerError::InvalidArguments { .. })
        ));
        assert!(matches!(
            broker.submit("test.increment", serde_json::json!({"n": "one"})).await,
            Err(BrokerError::InvalidArguments { .. })
        ));
        assert_eq!(broker.stats().await.unwrap().queued, 0);
    }

    #[tokio::test]
    async fn submit_applies_task_validation_to_decoded_args() {
        let broker = broker();

        let err = broker
            .submit("test.increment", serde_json::json!({"n": 1001}))
            .await
            .unwrap_err();
        assert!(matches!(&err, BrokerError::InvalidArguments { task, reason }
            if task == "test.increment" && reason.contains("at most 1000")));
        assert!(matches!(
            broker.start_pipeline("test.twice", serde_json::json!({"n": 5000})).await,
            Err(BrokerError::InvalidArguments { .. })
        ));
        assert_eq!(broker.stats().await.unwrap().active(), 0);

        broker
            .start_pipeline("test.twice", serde_json::json!({"n": 1}))
            .await
            .unwrap();
        let first = broker.claim().await.unwrap().unwrap();
        assert!(matches!(
            broker.continuation(&first, &serde_json::json!({"n": 1001})),
            Err(TaskError::InvalidArguments(_))
        ));
    }

    #[tokio::test]
    async fn requeue_and_purge_pass_through_to_the_queue() {
        let broker = broker();
        let id = broker.submit("test.increment", serde_json::json!({"n": 1})).await.unwrap();

        broker.claim().await.unwrap().unwrap();
        broker.requeue(id).await.unwrap();
        assert_eq!(broker.task(id).await.unwrap().unwrap().status, TaskStatus::Queued);

        broker.claim().await.unwrap().unwrap();
        broker.ack(id).await.unwrap();
        let later = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(broker.purge_finished(later).await.unwrap(), 1);
        assert!(broker.task(id).await.unwrap().is_none());
    }

    #[test]
    fn only_storage_outages_are_transient() {
        let locked = BrokerError::Queue(QueueError::Db(crate::db::DbError::Unavailable(
            "database is locked".to_string(),
        )));
        assert!(locked.is_transient());
        assert!(!BrokerError::Queue(QueueError::NotRunning(TaskId::new())).is_transient());
        assert!(!BrokerError::UnknownTask("x".to_string()).is_transient());
    }

    #[tokio::test]
    async fn start_pipeline_submits_first_step_with_cursor() {
        let broker = broker();
        let id = broker
            .start_pipeline("test.twice", serde_json::json!({"n": 0}))
            .await
            .unwrap();

        let msg = broker.task(id).await.unwrap().unwrap();
        let cursor = msg.pipeline.unwrap();
        assert_eq!(cursor.pipeline, "test.twice");
        assert_eq!(cursor.step, 0);

        assert!(matches!(
            broker.start_pipeline("test.nope", serde_json::json!({})).await,
            Err(BrokerError::UnknownPipeline(_))
        ));
    }

    #[tokio::test]
    async fn continuation_follows_pipeline_and_validates_args() {
        let broker = broker();
        broker
            .start_pipeline("test.twice", serde_json::json!({"n": 0}))
            .await
            .unwrap();
        let first = broker.claim().await.unwrap().unwrap();

        let next = broker
            .continuation(&first, &serde_json::json!({"n": 1}))
            .unwrap()
            .unwrap();
        assert_eq!(next.name, "test.increment");
        assert_eq!(next.args, serde_json::json!({"n": 1}));
        let cursor = next.pipeline.as_ref().unwrap();
        assert_eq!(cursor.step, 1);
        assert_eq!(cursor.run_id, first.pipeline.as_ref().unwrap().run_id);

        assert!(broker.continuation(&next, &serde_json::json!({"n": 2})).unwrap().is_none());
        assert!(matches!(
            broker.continuation(&first, &serde_json::json!({"n": -1})),
            Err(TaskError::InvalidArguments(_))
        ));
    }

    #[tokio::test]
    async fn retry_reports_resulting_status() {
        let broker = broker();
        let id = broker.submit("test.increment", serde_json::json!({"n": 1})).await.unwrap();

        broker.claim().await.unwrap().unwrap();
        assert_eq!(broker.retry(id, "boom").await.unwrap(), TaskStatus::FailedRetryable);

        broker.claim().await.unwrap().unwrap();
        assert_eq!(broker.retry(id, "boom").await.unwrap(), TaskStatus::FailedTerminal);

        let failed = broker.failed_tasks(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_submits_return_distinct_ids() {
        let broker = broker();

        let mut handles = Vec::new();
        for n in 0..50 {
            let broker = broker.clone();
            handles.push(tokio::spawn(async move {
                broker.submit("test.increment", serde_json::json!({"n": n})).await.unwrap()
            }));
        }

        let mut ids = HashSet::new();
        for handle in handles {
            assert!(ids.insert(handle.await.unwrap()));
        }
        assert_eq!(ids.len(), 50);
        assert_eq!(broker.stats().await.unwrap().queued, 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_never_share_a_message() {
        let broker = broker();
        for n in 0..30 {
            broker.submit("test.increment", serde_json::json!({"n": n})).await.unwrap();
        }

        let mut claimers = Vec::new();
        for _ in 0..6 {
            let broker = broker.clone();
            claimers.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(msg) = broker.claim().await.unwrap() {
                    claimed.push(msg.id);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for claimer in claimers {
            all.extend(claimer.await.unwrap());
        }
        let distinct: HashSet<_> = all.iter().copied().collect();
        assert_eq!(all.len(), 30);
        assert_eq!(distinct.len(), 30);
    }
}
