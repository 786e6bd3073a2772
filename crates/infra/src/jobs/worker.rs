//! Worker loop: claim, execute, finalize.
//!
//! Each claimed message runs in its own tokio task so a panicking handler
//! cannot take the worker down; the panic is reported as a retryable
//! failure. An optional per-task timeout is retryable too.
//!
//! Recording the outcome is retried with a short backoff while storage is
//! unavailable. If it stays unavailable the message is handed back to the
//! queue and will run again, so delivery is at least once.

use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use orderflow_core::TaskId;

use super::broker::{Broker, BrokerError};
use super::context::TaskContext;
use super::types::{TaskError, TaskMessage, TaskStatus};

/// Attempts at recording an outcome before the message is handed back.
const FINALIZE_ATTEMPTS: u32 = 4;
const FINALIZE_BACKOFF: Duration = Duration::from_millis(50);

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long to wait before polling an empty queue again
    pub poll_interval: Duration,
    /// Upper bound for one handler execution
    pub task_timeout: Option<Duration>,
    /// Name for logging
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            task_timeout: None,
            name: "worker".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub failed_terminal: u64,
    pub requeued: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: ProcessOutcome) {
        match outcome {
            ProcessOutcome::Idle => return,
            ProcessOutcome::Succeeded => self.succeeded += 1,
            ProcessOutcome::Retried => self.retried += 1,
            ProcessOutcome::FailedTerminal => self.failed_terminal += 1,
            ProcessOutcome::Requeued => self.requeued += 1,
        }
        self.processed += 1;
    }
}

/// What one claim/execute cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Nothing was ready
    Idle,
    Succeeded,
    /// Failed and scheduled for another attempt
    Retried,
    FailedTerminal,
    /// Ran, but the outcome could not be stored; the message is queued again
    Requeued,
}

/// How a claimed message is to be finalized.
#[derive(Debug)]
enum Verdict {
    Complete {
        result: JsonValue,
        next: Option<TaskMessage>,
    },
    Retry(String),
    Fail(String),
}

/// Single task consumer.
#[derive(Debug, Clone)]
pub struct Worker {
    broker: Broker,
    config: WorkerConfig,
    stats: Arc<Mutex<WorkerStats>>,
}

impl Worker {
    pub fn new(broker: Broker, config: WorkerConfig) -> Self {
        Self {
            broker,
            config,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Process messages until `shutdown` turns true or its sender is dropped.
    ///
    /// A message already being executed is finished before the loop exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.config.name, "worker started");

        while !*shutdown.borrow() {
            let idle = match self.process_next().await {
                Ok(ProcessOutcome::Idle) => true,
                Ok(_) => false,
                Err(e) => {
                    error!(worker = %self.config.name, error = %e, "failed to process task");
                    true
                }
            };

            if idle {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        info!(worker = %self.config.name, "worker stopped");
    }

    /// Run exactly one claim/execute cycle.
    pub async fn process_next(&self) -> Result<ProcessOutcome, BrokerError> {
        let Some(message) = self.broker.claim().await? else {
            return Ok(ProcessOutcome::Idle);
        };

        let span = info_span!(
            "task",
            worker = %self.config.name,
            task_id = %message.id,
            task = %message.name,
            attempt = message.attempts,
        );
        let outcome = self.execute(message).instrument(span).await?;

        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(outcome);
        Ok(outcome)
    }

    async fn execute(&self, message: TaskMessage) -> Result<ProcessOutcome, BrokerError> {
        debug!("claimed task");

        let verdict = match self.broker.registry().get(&message.name) {
            None => Verdict::Fail(
                TaskError::rejected(format!("unknown task '{}'", message.name)).to_string(),
            ),
            Some(handler) => {
                let ctx = TaskContext::for_message(&message, self.broker.clone());
                let args = message.args.clone();
                let run =
                    tokio::spawn(async move { handler.run_dyn(ctx, args).await }.in_current_span());

                match self.await_handler(run).await {
                    Ok(result) => self.on_success(&message, result),
                    Err(error) if error.is_retryable() => Verdict::Retry(error.to_string()),
                    Err(error) => Verdict::Fail(error.to_string()),
                }
            }
        };

        self.settle(message.id, verdict).await
    }

    async fn await_handler(
        &self,
        run: JoinHandle<Result<JsonValue, TaskError>>,
    ) -> Result<JsonValue, TaskError> {
        let joined = match self.config.task_timeout {
            Some(limit) => {
                let abort = run.abort_handle();
                match tokio::time::timeout(limit, run).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        abort.abort();
                        return Err(TaskError::failed(format!("timed out after {limit:?}")));
                    }
                }
            }
            None => run.await,
        };

        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(TaskError::failed(format!(
                "task panicked: {}",
                panic_message(e.into_panic())
            ))),
            Err(_) => Err(TaskError::failed("task was cancelled")),
        }
    }

    /// A successful execution completes the message, advancing its
    /// pipeline if it has one.
    fn on_success(&self, message: &TaskMessage, result: JsonValue) -> Verdict {
        match self.broker.continuation(message, &result) {
            Ok(next) => Verdict::Complete { result, next },
            Err(error) => Verdict::Fail(error.to_string()),
        }
    }

    /// Record `verdict`, handing the message back to the queue when storage
    /// stays unavailable.
    async fn settle(&self, id: TaskId, verdict: Verdict) -> Result<ProcessOutcome, BrokerError> {
        let verdict = &verdict;
        match with_storage_retry(move || self.apply(id, verdict)).await {
            Err(e) if e.is_transient() => {
                warn!(error = %e, "could not record task outcome, returning task to the queue");
                with_storage_retry(move || self.broker.requeue(id)).await?;
                Ok(ProcessOutcome::Requeued)
            }
            other => other,
        }
    }

    async fn apply(&self, id: TaskId, verdict: &Verdict) -> Result<ProcessOutcome, BrokerError> {
        match verdict {
            Verdict::Complete { result, next } => {
                self.broker.complete(id, result.clone(), next.clone()).await?;
                match next {
                    Some(next) => debug!(next_id = %next.id, "task succeeded, pipeline advanced"),
                    None => debug!("task succeeded"),
                }
                Ok(ProcessOutcome::Succeeded)
            }
            Verdict::Retry(error) => match self.broker.retry(id, error).await? {
                TaskStatus::FailedRetryable => Ok(ProcessOutcome::Retried),
                _ => Ok(ProcessOutcome::FailedTerminal),
            },
            Verdict::Fail(error) => {
                self.broker.fail(id, error).await?;
                Ok(ProcessOutcome::FailedTerminal)
            }
        }
    }
}

/// Retry `op` while it fails transiently, up to `FINALIZE_ATTEMPTS` calls.
async fn with_storage_retry<T, F, Fut>(mut op: F) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    let mut delay = FINALIZE_BACKOFF;
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < FINALIZE_ATTEMPTS => {
                warn!(error = %e, attempt, "storage unavailable, retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            result => return result,
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Spawns a fixed number of workers sharing one broker and one stats record.
pub struct WorkerPool;

impl WorkerPool {
    pub fn spawn(size: usize, broker: Broker, config: WorkerConfig) -> WorkerPoolHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));

        let joins = (0..size)
            .map(|i| {
                let worker = Worker {
                    broker: broker.clone(),
                    config: config.clone().with_name(format!("{}-{i}", config.name)),
                    stats: stats.clone(),
                };
                tokio::spawn(worker.run(shutdown_rx.clone()))
            })
            .collect();

        info!(size, "worker pool started");
        WorkerPoolHandle {
            shutdown,
            joins,
            stats,
        }
    }
}

/// Handle to control a running worker pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerPoolHandle {
    /// Signal every worker to stop and wait for in-flight tasks to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "worker exited abnormally");
            }
        }
        info!("worker pool stopped");
    }

    /// Aggregated statistics of all workers in the pool.
    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn size(&self) -> usize {
        self.joins.len()
    }
}
