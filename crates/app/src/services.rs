//! The two contracts callers use: submit work by name, and create/read
//! order aggregates.

use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, instrument};

use orderflow_core::{DomainError, OrderId, TaskId};
use orderflow_infra::db::{DbError, LoadStrategy, OrderRepository, Pagination, RepositoryError};
use orderflow_infra::jobs::{Broker, BrokerError, TaskMessage};
use orderflow_infra::tasks::{CHECKOUT_PIPELINE, CreateOrder, ValidateOrderArgs};
use orderflow_orders::{NewOrder, OrderView};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unknown task or pipeline '{0}'")]
    UnknownTask(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<BrokerError> for ServiceError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::UnknownTask(name) | BrokerError::UnknownPipeline(name) => {
                ServiceError::UnknownTask(name)
            }
            e @ BrokerError::InvalidArguments { .. } => ServiceError::Validation(e.to_string()),
            BrokerError::Queue(e) if e.is_transient() => ServiceError::Unavailable(e.to_string()),
            BrokerError::Queue(e) => ServiceError::Internal(e.to_string()),
        }
    }
}

impl From<RepositoryError> for ServiceError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Domain(DomainError::Conflict(msg)) => ServiceError::Conflict(msg),
            RepositoryError::Domain(e) => ServiceError::Validation(e.to_string()),
            RepositoryError::Db(DbError::Conflict(msg)) => ServiceError::Conflict(msg),
            RepositoryError::Db(DbError::Constraint(msg)) => ServiceError::Validation(msg),
            RepositoryError::Db(DbError::Unavailable(msg)) => ServiceError::Unavailable(msg),
            RepositoryError::Db(DbError::Storage(msg)) => ServiceError::Internal(msg),
        }
    }
}

/// Returned as soon as work is queued; execution happens later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubmitReceipt {
    pub task_id: TaskId,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CreatedOrder {
    pub order_id: OrderId,
    pub total_amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderPage {
    pub orders: Vec<OrderView>,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone)]
pub struct OrderService {
    orders: OrderRepository,
    broker: Broker,
}

impl OrderService {
    pub fn new(orders: OrderRepository, broker: Broker) -> Self {
        Self { orders, broker }
    }

    /// Queue a registered task by name.
    #[instrument(skip(self, args), err)]
    pub async fn submit(&self, name: &str, args: JsonValue) -> Result<SubmitReceipt, ServiceError> {
        let task_id = self.broker.submit(name, args).await?;
        Ok(SubmitReceipt { task_id })
    }

    /// Start the validate-then-charge pipeline for an order.
    #[instrument(skip(self), fields(order_id = %order_id), err)]
    pub async fn start_checkout(
        &self,
        order_id: OrderId,
        user_name: &str,
    ) -> Result<SubmitReceipt, ServiceError> {
        let args = serde_json::to_value(ValidateOrderArgs {
            order_id,
            user_name: user_name.to_string(),
        })
        .map_err(|e| ServiceError::Internal(e.to_string()))?;

        let task_id = self.broker.start_pipeline(CHECKOUT_PIPELINE, args).await?;
        info!(%task_id, "checkout started");
        Ok(SubmitReceipt { task_id })
    }

    /// Create an order aggregate synchronously, in one transaction.
    #[instrument(skip(self, new_order), err)]
    pub async fn create(&self, new_order: NewOrder) -> Result<CreatedOrder, ServiceError> {
        let order = self.orders.create(&new_order).await?;
        Ok(CreatedOrder {
            order_id: order.id,
            total_amount: order.total_amount,
        })
    }

    /// Validate now, persist later through the `order.create` task.
    ///
    /// Validation happens in the broker, which runs the task's own checks.
    #[instrument(skip(self, new_order), err)]
    pub async fn create_async(&self, new_order: NewOrder) -> Result<SubmitReceipt, ServiceError> {
        let task_id = self.broker.submit_task::<CreateOrder>(&new_order).await?;
        Ok(SubmitReceipt { task_id })
    }

    /// Read one order; children are loaded in batch only when asked for.
    pub async fn get(
        &self,
        order_id: OrderId,
        load_children: bool,
    ) -> Result<Option<OrderView>, ServiceError> {
        let strategy = if load_children {
            LoadStrategy::Batched
        } else {
            LoadStrategy::Lazy
        };
        let order = self.orders.get(order_id, strategy).await?;
        Ok(order.as_ref().map(OrderView::from))
    }

    pub async fn list(
        &self,
        limit: Option<u32>,
        offset: Option<u32>,
        load_children: bool,
    ) -> Result<OrderPage, ServiceError> {
        let page = Pagination::new(limit, offset);
        let orders = if load_children {
            self.orders.list_with_children(page).await?
        } else {
            self.orders.list(page).await?
        };

        Ok(OrderPage {
            orders: orders.iter().map(OrderView::from).collect(),
            limit: page.limit(),
            offset: page.offset(),
        })
    }

    /// Current state of a submitted task, including its result or last error.
    pub async fn task(&self, task_id: TaskId) -> Result<Option<TaskMessage>, ServiceError> {
        Ok(self.broker.task(task_id).await?)
    }
}
