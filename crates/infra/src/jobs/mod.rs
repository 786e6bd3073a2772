//! Background task pipeline: broker, queue, workers.
//!
//! ## Design
//!
//! - Tasks are named and typed; arguments travel as JSON objects
//! - The broker validates arguments at submit time and snapshots the task's
//!   retry policy into the message
//! - Workers claim messages atomically, so each delivery runs on exactly one
//!   worker
//! - Failed deliveries are retried with backoff until the policy is
//!   exhausted, then kept as terminal failures for inspection
//!
//! ## Components
//!
//! - `Task` / `TaskRegistry`: handlers keyed by name
//! - `TaskQueue`: message persistence (in-memory or SQLite)
//! - `Broker`: submit, claim, and finalize messages
//! - `Worker` / `WorkerPool`: execution loop with graceful shutdown

pub mod broker;
pub mod context;
pub mod registry;
pub mod sqlite_store;
pub mod store;
pub mod types;
pub mod worker;

pub use broker::{Broker, BrokerError};
pub use context::TaskContext;
pub use registry::{DynTask, RegistryError, Task, TaskRegistry};
pub use sqlite_store::SqliteTaskQueue;
pub use store::{InMemoryTaskQueue, QueueError, QueueStats, TaskQueue};
pub use types::{
    BackoffStrategy, PipelineCursor, RetryPolicy, TaskError, TaskMessage, TaskStatus,
};
pub use worker::{ProcessOutcome, Worker, WorkerConfig, WorkerPool, WorkerPoolHandle, WorkerStats};
