//! Core task types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use orderflow_core::TaskId;

/// Task message status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed
    Queued,
    /// Claimed by a worker
    Running,
    /// Handler returned successfully
    Succeeded,
    /// Failed, will be claimable again once `available_at` passes
    FailedRetryable,
    /// Retries exhausted or failure not retryable
    FailedTerminal,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::FailedRetryable => "failed_retryable",
            TaskStatus::FailedTerminal => "failed_terminal",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::FailedTerminal)
    }

    /// Whether a message in this status may be handed to a worker.
    pub fn is_claimable(&self) -> bool {
        matches!(self, TaskStatus::Queued | TaskStatus::FailedRetryable)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed_retryable" => Ok(TaskStatus::FailedRetryable),
            "failed_terminal" => Ok(TaskStatus::FailedTerminal),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    #[default]
    Fixed,
    /// Exponential backoff: delay * 2^(retry - 1)
    Exponential,
    /// Linear backoff: delay * retry
    Linear,
}

/// Retry policy, snapshotted into each message at submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first execution (0 = no retries)
    pub max_retries: u32,
    /// Base delay before a retry becomes claimable
    pub delay: Duration,
    /// Cap for growing strategies
    pub max_delay: Duration,
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(2))
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            max_delay: delay,
            backoff: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_retries: u32, delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            max_delay,
            backoff: BackoffStrategy::Exponential,
        }
    }

    /// Create a policy with linear backoff.
    pub fn linear(max_retries: u32, delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            max_delay,
            backoff: BackoffStrategy::Linear,
        }
    }

    /// Delay before the given retry (1-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        match self.backoff {
            BackoffStrategy::Fixed => self.delay,
            BackoffStrategy::Exponential => {
                let factor = 2_u32.saturating_pow(retry - 1);
                self.delay.saturating_mul(factor).min(self.max_delay)
            }
            BackoffStrategy::Linear => self.delay.saturating_mul(retry).min(self.max_delay),
        }
    }

    /// Check if another retry is allowed after `attempts` retries.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_retries
    }
}

/// Position of a message inside a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineCursor {
    pub pipeline: String,
    pub step: usize,
    /// Shared by every message of one run.
    pub run_id: Uuid,
}

impl PipelineCursor {
    pub fn start(pipeline: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            step: 0,
            run_id: Uuid::now_v7(),
        }
    }

    pub fn next(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
            step: self.step + 1,
            run_id: self.run_id,
        }
    }
}

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: TaskId,
    /// Registered task name used for routing
    pub name: String,
    /// JSON object handed to the handler
    pub args: JsonValue,
    /// Retries performed so far (starts at 0)
    pub attempts: u32,
    pub retry_policy: RetryPolicy,
    pub status: TaskStatus,
    pub last_error: Option<String>,
    /// Handler output, set on success
    pub result: Option<JsonValue>,
    pub pipeline: Option<PipelineCursor>,
    /// Not claimable before this instant
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskMessage {
    /// Create a queued message, claimable immediately.
    pub fn new(name: impl Into<String>, args: JsonValue, retry_policy: RetryPolicy) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            name: name.into(),
            args,
            attempts: 0,
            retry_policy,
            status: TaskStatus::Queued,
            last_error: None,
            result: None,
            pipeline: None,
            available_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn in_pipeline(mut self, cursor: PipelineCursor) -> Self {
        self.pipeline = Some(cursor);
        self
    }

    /// Check if the message can be claimed at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.available_at <= now
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        self.updated_at = now;
    }

    pub fn mark_succeeded(&mut self, result: JsonValue, now: DateTime<Utc>) {
        self.status = TaskStatus::Succeeded;
        self.result = Some(result);
        self.updated_at = now;
    }

    /// Apply the retry policy to a failed execution.
    ///
    /// Below `max_retries` the message becomes `FailedRetryable` with one
    /// more attempt recorded and is delayed by the policy; otherwise it is
    /// `FailedTerminal`.
    pub fn mark_retry(&mut self, error: String, now: DateTime<Utc>) -> TaskStatus {
        if self.retry_policy.should_retry(self.attempts) {
            self.attempts += 1;
            let delay = self.retry_policy.delay_for_retry(self.attempts);
            self.available_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
            self.status = TaskStatus::FailedRetryable;
        } else {
            self.status = TaskStatus::FailedTerminal;
        }
        self.last_error = Some(error);
        self.updated_at = now;
        self.status
    }

    /// Fail without consulting the retry policy.
    pub fn mark_failed(&mut self, error: String, now: DateTime<Utc>) {
        self.status = TaskStatus::FailedTerminal;
        self.last_error = Some(error);
        self.updated_at = now;
    }

    /// Put a message orphaned in `Running` back in the queue.
    pub fn mark_requeued(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Queued;
        self.available_at = now;
        self.updated_at = now;
    }
}

/// Failure reported by a task handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// Arguments could not be decoded or are semantically invalid
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    /// The handler refused the work; retrying cannot help
    #[error("rejected: {0}")]
    Rejected(String),
    /// Transient failure; eligible for retry
    #[error("failed: {0}")]
    Failed(String),
}

impl TaskError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    pub fn invalid_arguments(msg: impl Into<String>) -> Self {
        Self::InvalidArguments(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Failed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_retry(4), Duration::from_millis(800));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy::exponential(40, Duration::from_secs(1), Duration::from_secs(30));

        assert_eq!(policy.delay_for_retry(6), Duration::from_secs(30));
        assert_eq!(policy.delay_for_retry(40), Duration::from_secs(30));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy::linear(5, Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(300));
    }

    #[test]
    fn default_policy_is_three_retries_two_seconds_apart() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(2));
        assert_eq!(policy.backoff, BackoffStrategy::Fixed);
    }

    #[test]
    fn should_retry_respects_max_retries() {
        let policy = RetryPolicy::fixed(3, Duration::ZERO);

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn message_lifecycle() {
        let mut msg = TaskMessage::new("test", serde_json::json!({"key": "value"}), RetryPolicy::default());
        let now = Utc::now();

        assert_eq!(msg.status, TaskStatus::Queued);
        assert_eq!(msg.attempts, 0);
        assert!(msg.is_ready(now));

        msg.mark_running(now);
        assert_eq!(msg.status, TaskStatus::Running);
        assert!(!msg.is_ready(now));

        msg.mark_succeeded(serde_json::json!({"ok": true}), now);
        assert!(msg.status.is_terminal());
        assert_eq!(msg.result, Some(serde_json::json!({"ok": true})));
    }

    #[test]
    fn failure_is_retried_until_policy_is_exhausted() {
        let mut msg = TaskMessage::new(
            "test",
            serde_json::json!({}),
            RetryPolicy::fixed(2, Duration::from_secs(2)),
        );
        let now = Utc::now();

        msg.mark_running(now);
        assert_eq!(msg.mark_retry("error 1".to_string(), now), TaskStatus::FailedRetryable);
        assert_eq!(msg.attempts, 1);
        assert_eq!(msg.available_at, now + chrono::Duration::seconds(2));
        assert!(!msg.is_ready(now));
        assert!(msg.is_ready(now + chrono::Duration::seconds(2)));

        msg.mark_running(now);
        assert_eq!(msg.mark_retry("error 2".to_string(), now), TaskStatus::FailedRetryable);
        assert_eq!(msg.attempts, 2);

        msg.mark_running(now);
        assert_eq!(msg.mark_retry("error 3".to_string(), now), TaskStatus::FailedTerminal);
        assert_eq!(msg.attempts, 2);
        assert_eq!(msg.last_error.as_deref(), Some("error 3"));
    }

    #[test]
    fn no_retry_policy_fails_terminally_on_first_error() {
        let mut msg = TaskMessage::new("test", serde_json::json!({}), RetryPolicy::no_retry());
        assert_eq!(
            msg.mark_retry("boom".to_string(), Utc::now()),
            TaskStatus::FailedTerminal
        );
        assert_eq!(msg.attempts, 0);
    }

    #[test]
    fn status_parses_its_own_rendering() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskStatus::Succeeded,
            TaskStatus::FailedRetryable,
            TaskStatus::FailedTerminal,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("paused".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn only_failed_is_retryable() {
        assert!(TaskError::failed("db down").is_retryable());
        assert!(!TaskError::rejected("order cancelled").is_retryable());
        assert!(!TaskError::invalid_arguments("missing order_id").is_retryable());
    }

    mod proptest_tests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Property: backoff never decreases and never exceeds the cap.
            #[test]
            fn backoff_is_monotonic_and_capped(
                base_ms in 1u64..5_000u64,
                cap_ms in 1u64..60_000u64,
                retry in 1u32..64u32,
                exponential in any::<bool>(),
            ) {
                let (delay, cap) = (Duration::from_millis(base_ms), Duration::from_millis(cap_ms));
                let policy = if exponential {
                    RetryPolicy::exponential(u32::MAX, delay, cap)
                } else {
                    RetryPolicy::linear(u32::MAX, delay, cap)
                };

                prop_assert!(policy.delay_for_retry(retry) <= cap);
                prop_assert!(policy.delay_for_retry(retry) <= policy.delay_for_retry(retry + 1));
            }

            /// Property: a message is retried exactly `max_retries` times.
            #[test]
            fn retries_stop_at_max_retries(max_retries in 0u32..20u32) {
                let policy = RetryPolicy::fixed(max_retries, Duration::ZERO);
                let mut msg = TaskMessage::new("prop", serde_json::json!({}), policy);

                let mut retried = 0;
                while msg.mark_retry("boom".to_string(), Utc::now()) == TaskStatus::FailedRetryable {
                    retried += 1;
                    prop_assert_eq!(msg.attempts, retried);
                }
                prop_assert_eq!(retried, max_retries);
                prop_assert_eq!(msg.status, TaskStatus::FailedTerminal);
            }
        }
    }
}
