use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use thiserror::Error;
use tracing::{info, instrument};

use orderflow_infra::config::AppConfig;
use orderflow_infra::db::{Database, DbError, OrderRepository};
use orderflow_infra::jobs::{
    Broker, BrokerError, RegistryError, SqliteTaskQueue, TaskRegistry, WorkerConfig, WorkerPool,
    WorkerPoolHandle,
};
use orderflow_infra::tasks;

use crate::services::OrderService;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("database setup failed: {0}")]
    Db(#[from] DbError),

    #[error("task registration failed: {0}")]
    Registry(#[from] RegistryError),
}

/// Process-wide resources.
///
/// Built once by the entry point and handed to whatever needs them; the
/// database pool and the broker live exactly as long as this value.
#[derive(Debug, Clone)]
pub struct AppContext {
    config: AppConfig,
    db: Database,
    orders: OrderRepository,
    broker: Broker,
}

impl AppContext {
    /// Connect to the configured database, apply the schema and register
    /// every task.
    #[instrument(skip_all, fields(database = %config.database_url), err)]
    pub async fn build(config: AppConfig) -> Result<Self, ContextError> {
        let db = Database::connect(&config.database_url, config.db_max_connections).await?;
        db.migrate().await?;
        Self::assemble(config, db)
    }

    /// Context over a private in-memory database.
    pub async fn in_memory(config: AppConfig) -> Result<Self, ContextError> {
        let db = Database::connect_in_memory().await?;
        Self::assemble(config, db)
    }

    fn assemble(config: AppConfig, db: Database) -> Result<Self, ContextError> {
        let orders = OrderRepository::new(db.clone());

        let mut registry = TaskRegistry::new();
        tasks::register_all(&mut registry, orders.clone())?;
        info!(tasks = ?registry.task_names(), "task registry ready");

        let queue = Arc::new(SqliteTaskQueue::new(db.clone()));
        let broker = Broker::new(queue, Arc::new(registry));

        Ok(Self {
            config,
            db,
            orders,
            broker,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn orders(&self) -> &OrderRepository {
        &self.orders
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn order_service(&self) -> OrderService {
        OrderService::new(self.orders.clone(), self.broker.clone())
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_name("orderflow-worker")
            .with_poll_interval(self.config.poll_interval)
            .with_task_timeout(self.config.task_timeout)
    }

    /// Delete finished tasks older than `config.task_retention`.
    pub async fn purge_expired_tasks(&self) -> Result<usize, BrokerError> {
        let retention = TimeDelta::from_std(self.config.task_retention).unwrap_or(TimeDelta::MAX);
        match Utc::now().checked_sub_signed(retention) {
            Some(cutoff) => self.broker.purge_finished(cutoff).await,
            None => Ok(0),
        }
    }

    /// Start `config.workers` workers on the current runtime.
    pub fn spawn_workers(&self) -> WorkerPoolHandle {
        WorkerPool::spawn(self.config.workers, self.broker.clone(), self.worker_config())
    }

    /// Close the database pool. Stop the worker pool first.
    pub async fn shutdown(self) {
        self.db.close().await;
        info!("application context closed");
    }
}
