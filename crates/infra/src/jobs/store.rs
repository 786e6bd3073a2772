//! Task queue storage: trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use orderflow_core::TaskId;

use crate::db::DbError;

use super::types::{TaskMessage, TaskStatus};

/// Queue storage abstraction.
///
/// Every method that changes a claimed message is guarded by its `Running`
/// status, so a message is only ever finalized by the worker that claimed it.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a new message.
    async fn enqueue(&self, message: TaskMessage) -> Result<TaskId, QueueError>;

    /// Get a message by ID, active or finished.
    async fn get(&self, id: TaskId) -> Result<Option<TaskMessage>, QueueError>;

    /// Claim the next ready message (oldest `available_at` first) and mark it
    /// running. Returns None if nothing is ready.
    async fn claim_next(&self) -> Result<Option<TaskMessage>, QueueError>;

    /// Mark a running message succeeded and, in the same step, enqueue its
    /// continuation.
    async fn complete(
        &self,
        id: TaskId,
        result: JsonValue,
        continuation: Option<TaskMessage>,
    ) -> Result<(), QueueError>;

    /// Apply the message's retry policy to a failed execution.
    async fn retry(&self, id: TaskId, error: String) -> Result<TaskMessage, QueueError>;

    /// Fail a running message terminally.
    async fn fail(&self, id: TaskId, error: String) -> Result<TaskMessage, QueueError>;

    /// Terminally failed messages, most recent first.
    async fn list_failed(&self, limit: usize) -> Result<Vec<TaskMessage>, QueueError>;

    /// Count messages per status.
    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Return every message stuck in `Running` to the queue.
    async fn requeue_running(&self) -> Result<usize, QueueError>;

    /// Return one running message to the queue without counting an attempt.
    async fn requeue(&self, id: TaskId) -> Result<(), QueueError>;

    /// Delete succeeded and terminally failed messages last updated before
    /// `before`. Returns how many were removed.
    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize, QueueError>;
}

/// Task queue error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueueError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("task {0} is not running")]
    NotRunning(TaskId),
    #[error("task already exists: {0}")]
    AlreadyExists(TaskId),
    #[error("corrupt task record: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("storage error: {0}")]
    Storage(String),
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Db(e) if e.is_transient())
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed_retryable: usize,
    pub failed_terminal: usize,
}

impl QueueStats {
    pub(crate) fn count(&mut self, status: TaskStatus, n: usize) {
        match status {
            TaskStatus::Queued => self.queued += n,
            TaskStatus::Running => self.running += n,
            TaskStatus::Succeeded => self.succeeded += n,
            TaskStatus::FailedRetryable => self.failed_retryable += n,
            TaskStatus::FailedTerminal => self.failed_terminal += n,
        }
    }

    /// Messages not yet finalized.
    pub fn active(&self) -> usize {
        self.queued + self.running + self.failed_retryable
    }
}

#[derive(Debug, Default)]
struct Tasks {
    active: HashMap<TaskId, TaskMessage>,
    finished: HashMap<TaskId, TaskMessage>,
}

impl Tasks {
    fn running_mut(&mut self, id: TaskId) -> Result<&mut TaskMessage, QueueError> {
        match self.active.get_mut(&id) {
            Some(msg) if msg.status == TaskStatus::Running => Ok(msg),
            Some(_) => Err(QueueError::NotRunning(id)),
            None if self.finished.contains_key(&id) => Err(QueueError::NotRunning(id)),
            None => Err(QueueError::NotFound(id)),
        }
    }

    fn finish(&mut self, id: TaskId) -> Option<TaskMessage> {
        let msg = self.active.remove(&id)?;
        self.finished.insert(id, msg.clone());
        Some(msg)
    }
}

/// In-memory task queue for tests/dev.
///
/// Claimable and running messages live in the active map; succeeded and
/// terminally failed ones move to the finished map.
#[derive(Debug, Default)]
pub struct InMemoryTaskQueue {
    tasks: RwLock<Tasks>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tasks>, QueueError> {
        self.tasks
            .read()
            .map_err(|_| QueueError::Storage("task queue lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tasks>, QueueError> {
        self.tasks
            .write()
            .map_err(|_| QueueError::Storage("task queue lock poisoned".to_string()))
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, message: TaskMessage) -> Result<TaskId, QueueError> {
        let mut tasks = self.write()?;
        if tasks.active.contains_key(&message.id) || tasks.finished.contains_key(&message.id) {
            return Err(QueueError::AlreadyExists(message.id));
        }
        let id = message.id;
        tasks.active.insert(id, message);
        Ok(id)
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskMessage>, QueueError> {
        let tasks = self.read()?;
        Ok(tasks
            .active
            .get(&id)
            .or_else(|| tasks.finished.get(&id))
            .cloned())
    }

    async fn claim_next(&self) -> Result<Option<TaskMessage>, QueueError> {
        let mut tasks = self.write()?;
        let now = Utc::now();

        // Oldest ready message first; ids are time-ordered and break ties.
        let next = tasks
            .active
            .values()
            .filter(|m| m.is_ready(now))
            .min_by_key(|m| (m.available_at, m.id))
            .map(|m| m.id);

        Ok(next.and_then(|id| {
            let msg = tasks.active.get_mut(&id)?;
            msg.mark_running(now);
            Some(msg.clone())
        }))
    }

    async fn complete(
        &self,
        id: TaskId,
        result: JsonValue,
        continuation: Option<TaskMessage>,
    ) -> Result<(), QueueError> {
        let mut tasks = self.write()?;

        if let Some(next) = &continuation {
            if tasks.active.contains_key(&next.id) || tasks.finished.contains_key(&next.id) {
                return Err(QueueError::AlreadyExists(next.id));
            }
        }

        tasks.running_mut(id)?.mark_succeeded(result, Utc::now());
        tasks.finish(id);

        if let Some(next) = continuation {
            tasks.active.insert(next.id, next);
        }
        Ok(())
    }

    async fn retry(&self, id: TaskId, error: String) -> Result<TaskMessage, QueueError> {
        let mut tasks = self.write()?;
        let msg = tasks.running_mut(id)?;
        let status = msg.mark_retry(error, Utc::now());
        let updated = msg.clone();

        if status.is_terminal() {
            tasks.finish(id);
        }
        Ok(updated)
    }

    async fn fail(&self, id: TaskId, error: String) -> Result<TaskMessage, QueueError> {
        let mut tasks = self.write()?;
        tasks.running_mut(id)?.mark_failed(error, Utc::now());
        tasks.finish(id).ok_or(QueueError::NotFound(id))
    }

    async fn list_failed(&self, limit: usize) -> Result<Vec<TaskMessage>, QueueError> {
        let tasks = self.read()?;
        let mut result: Vec<_> = tasks
            .finished
            .values()
            .filter(|m| m.status == TaskStatus::FailedTerminal)
            .cloned()
            .collect();

        result.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        result.truncate(limit);
        Ok(result)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let tasks = self.read()?;
        let mut stats = QueueStats::default();

        for msg in tasks.active.values().chain(tasks.finished.values()) {
            stats.count(msg.status, 1);
        }

        Ok(stats)
    }

    async fn requeue_running(&self) -> Result<usize, QueueError> {
        let mut tasks = self.write()?;
        let now = Utc::now();
        let mut requeued = 0;

        for msg in tasks.active.values_mut() {
            if msg.status == TaskStatus::Running {
                msg.mark_requeued(now);
                requeued += 1;
            }
        }

        Ok(requeued)
    }

    async fn requeue(&self, id: TaskId) -> Result<(), QueueError> {
        let mut tasks = self.write()?;
        tasks.running_mut(id)?.mark_requeued(Utc::now());
        Ok(())
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut tasks = self.write()?;
        let len = tasks.finished.len();
        tasks.finished.retain(|_, msg| msg.updated_at >= before);
        Ok(len - tasks.finished.len())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::jobs::types::RetryPolicy;

    fn message(name: &str) -> TaskMessage {
        TaskMessage::new(name, serde_json::json!({}), RetryPolicy::fixed(1, Duration::ZERO))
    }

    #[tokio::test]
    async fn enqueue_and_claim() {
        let queue = InMemoryTaskQueue::new();

        let id = queue.enqueue(message("test")).await.unwrap();

        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, TaskStatus::Running);
        assert_eq!(claimed.attempts, 0);

        // No more messages
        assert!(queue.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let queue = InMemoryTaskQueue::new();
        let msg = message("test");

        queue.enqueue(msg.clone()).await.unwrap();
        assert_eq!(
            queue.enqueue(msg.clone()).await,
            Err(QueueError::AlreadyExists(msg.id))
        );
    }

    #[tokio::test]
    async fn claims_oldest_available_first() {
        let queue = InMemoryTaskQueue::new();
        let recent = message("recent");
        let mut older = message("older");
        older.available_at = recent.available_at - chrono::Duration::milliseconds(5);

        let second = queue.enqueue(recent).await.unwrap();
        let first = queue.enqueue(older).await.unwrap();

        assert_eq!(queue.claim_next().await.unwrap().unwrap().id, first);
        assert_eq!(queue.claim_next().await.unwrap().unwrap().id, second);
    }

    #[tokio::test]
    async fn delayed_retry_is_not_claimable_early() {
        let queue = InMemoryTaskQueue::new();
        let msg = TaskMessage::new("slow", serde_json::json!({}), RetryPolicy::fixed(1, Duration::from_secs(3600)));
        let id = queue.enqueue(msg).await.unwrap();

        queue.claim_next().await.unwrap().unwrap();
        let retried = queue.retry(id, "boom".to_string()).await.unwrap();
        assert_eq!(retried.status, TaskStatus::FailedRetryable);
        assert_eq!(retried.attempts, 1);

        assert!(queue.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn complete_moves_message_out_of_active_set_and_enqueues_continuation() {
        let queue = InMemoryTaskQueue::new();
        let id = queue.enqueue(message("step-1")).await.unwrap();
        queue.claim_next().await.unwrap().unwrap();

        let next = message("step-2");
        let next_id = next.id;
        queue
            .complete(id, serde_json::json!({"n": 1}), Some(next))
            .await
            .unwrap();

        let done = queue.get(id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Succeeded);
        assert_eq!(done.result, Some(serde_json::json!({"n": 1})));

        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, next_id);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.active(), 1);
    }

    #[tokio::test]
    async fn only_running_messages_can_be_finalized() {
        let queue = InMemoryTaskQueue::new();
        let id = queue.enqueue(message("test")).await.unwrap();

        assert_eq!(
            queue.complete(id, JsonValue::Null, None).await,
            Err(QueueError::NotRunning(id))
        );

        queue.claim_next().await.unwrap();
        queue.complete(id, JsonValue::Null, None).await.unwrap();
        assert_eq!(
            queue.fail(id, "late".to_string()).await,
            Err(QueueError::NotRunning(id))
        );

        let missing = TaskId::new();
        assert_eq!(
            queue.retry(missing, "x".to_string()).await,
            Err(QueueError::NotFound(missing))
        );
    }

    #[tokio::test]
    async fn terminal_failures_are_kept_and_listed() {
        let queue = InMemoryTaskQueue::new();

        let id = queue.enqueue(message("doomed")).await.unwrap();
        queue.claim_next().await.unwrap();
        queue.fail(id, "bad input".to_string()).await.unwrap();

        let failed = queue.list_failed(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, id);
        assert_eq!(failed[0].last_error.as_deref(), Some("bad input"));

        // Never redelivered
        assert!(queue.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn requeue_running_recovers_orphans() {
        let queue = InMemoryTaskQueue::new();
        let id = queue.enqueue(message("orphan")).await.unwrap();
        queue.claim_next().await.unwrap();

        assert_eq!(queue.requeue_running().await.unwrap(), 1);
        assert_eq!(queue.claim_next().await.unwrap().unwrap().id, id);
    }

    #[tokio::test]
    async fn stats_tracking() {
        let queue = InMemoryTaskQueue::new();

        for i in 0..5 {
            let msg = TaskMessage::new("test", serde_json::json!({"i": i}), RetryPolicy::default());
            queue.enqueue(msg).await.unwrap();
        }

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.queued, 5);

        queue.claim_next().await.unwrap();
        queue.claim_next().await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.queued, 3);
        assert_eq!(stats.running, 2);
    }

    #[tokio::test]
    async fn requeue_returns_one_running_message() {
        let queue = InMemoryTaskQueue::new();
        let id = queue.enqueue(message("test")).await.unwrap();
        let other = queue.enqueue(message("other")).await.unwrap();

        assert_eq!(queue.requeue(id).await, Err(QueueError::NotRunning(id)));

        queue.claim_next().await.unwrap().unwrap();
        queue.claim_next().await.unwrap().unwrap();
        queue.requeue(id).await.unwrap();

        let msg = queue.get(id).await.unwrap().unwrap();
        assert_eq!(msg.status, TaskStatus::Queued);
        assert_eq!(msg.attempts, 0);
        assert_eq!(queue.get(other).await.unwrap().unwrap().status, TaskStatus::Running);
        assert_eq!(queue.claim_next().await.unwrap().unwrap().id, id);

        let missing = TaskId::new();
        assert_eq!(queue.requeue(missing).await, Err(QueueError::NotFound(missing)));
    }

    #[tokio::test]
    async fn purge_removes_only_old_finished_messages() {
        let queue = InMemoryTaskQueue::new();
        let done = queue.enqueue(message("done")).await.unwrap();
        let failed = queue.enqueue(message("failed")).await.unwrap();
        let pending = queue.enqueue(message("pending")).await.unwrap();

        queue.claim_next().await.unwrap();
        queue.claim_next().await.unwrap();
        queue.complete(done, JsonValue::Null, None).await.unwrap();
        queue.fail(failed, "boom".to_string()).await.unwrap();

        let before_finish = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(queue.purge_finished(before_finish).await.unwrap(), 0);

        let cutoff = Utc::now() + chrono::Duration::milliseconds(1);
        assert_eq!(queue.purge_finished(cutoff).await.unwrap(), 2);
        assert!(queue.get(done).await.unwrap().is_none());
        assert!(queue.get(failed).await.unwrap().is_none());
        assert!(queue.get(pending).await.unwrap().is_some());
        assert_eq!(queue.stats().await.unwrap().active(), 1);
    }
}
