use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use orderflow_core::OrderId;
use orderflow_orders::{NewOrder, OrderStatus};

use crate::db::OrderRepository;
use crate::jobs::{Task, TaskContext, TaskError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedOrderSummary {
    pub order_id: OrderId,
    pub customer_name: String,
    pub total_amount: f64,
    pub items_count: usize,
    pub payments_count: usize,
}

/// Persist an order aggregate in the background.
pub struct CreateOrder {
    orders: OrderRepository,
}

impl CreateOrder {
    pub fn new(orders: OrderRepository) -> Self {
        Self { orders }
    }
}

#[async_trait]
impl Task for CreateOrder {
    const NAME: &'static str = "order.create";
    type Args = NewOrder;
    type Output = CreatedOrderSummary;

    fn validate(&self, args: &NewOrder) -> Result<(), TaskError> {
        args.validate()
            .map_err(|e| TaskError::invalid_arguments(e.to_string()))
    }

    #[instrument(name = "order.create", skip_all, fields(customer = %args.customer_name))]
    async fn run(&self, _ctx: TaskContext, args: NewOrder) -> Result<CreatedOrderSummary, TaskError> {
        let order = self.orders.create(&args).await?;
        info!(order_id = %order.id, total_amount = order.total_amount, "order created");

        Ok(CreatedOrderSummary {
            order_id: order.id,
            customer_name: order.customer_name,
            total_amount: order.total_amount,
            items_count: args.items.len(),
            payments_count: args.payments.len(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOrderArgs {
    pub order_id: OrderId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedOrder {
    pub order_id: OrderId,
    pub items_count: usize,
    pub total_paid: f64,
    pub status: OrderStatus,
}

/// Mark an order processed after reading its children.
///
/// Existence is checked with a lazy read; the children are only loaded once
/// the order is known to be processable.
pub struct ProcessOrder {
    orders: OrderRepository,
}

impl ProcessOrder {
    pub fn new(orders: OrderRepository) -> Self {
        Self { orders }
    }
}

#[async_trait]
impl Task for ProcessOrder {
    const NAME: &'static str = "order.process";
    type Args = ProcessOrderArgs;
    type Output = ProcessedOrder;

    #[instrument(name = "order.process", skip_all, fields(order_id = %args.order_id))]
    async fn run(&self, _ctx: TaskContext, args: ProcessOrderArgs) -> Result<ProcessedOrder, TaskError> {
        let id = args.order_id;
        let Some(order) = self.orders.get_lazy(id).await? else {
            return Err(TaskError::rejected(format!("order {id} not found")));
        };
        if order.status == OrderStatus::Cancelled {
            return Err(TaskError::rejected(format!("order {id} is cancelled")));
        }

        let order = self
            .orders
            .get_eager_batched(id)
            .await?
            .ok_or_else(|| TaskError::rejected(format!("order {id} was deleted")))?;
        let items_count = order.items.as_slice().map_or(0, <[_]>::len);
        let total_paid = order.total_paid().unwrap_or_default();

        self.orders
            .update_status(id, OrderStatus::Processed)
            .await?
            .ok_or_else(|| TaskError::rejected(format!("order {id} was deleted")))?;
        info!(items_count, total_paid, "order processed");

        Ok(ProcessedOrder {
            order_id: id,
            items_count,
            total_paid,
            status: OrderStatus::Processed,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use orderflow_orders::{NewOrderItem, NewPayment};

    use super::*;
    use crate::db::Database;
    use crate::jobs::{
        Broker, BrokerError, InMemoryTaskQueue, ProcessOutcome, TaskRegistry, TaskStatus, Worker,
        WorkerConfig,
    };

    struct Fixture {
        orders: OrderRepository,
        broker: Broker,
        worker: Worker,
    }

    async fn fixture() -> Fixture {
        let db = Database::connect_in_memory().await.unwrap();
        let orders = OrderRepository::new(db);

        let mut registry = TaskRegistry::new();
        registry.register(CreateOrder::new(orders.clone())).unwrap();
        registry.register(ProcessOrder::new(orders.clone())).unwrap();
        let broker = Broker::new(InMemoryTaskQueue::arc(), Arc::new(registry));
        let worker = Worker::new(broker.clone(), WorkerConfig::default());

        Fixture { orders, broker, worker }
    }

    fn alice() -> NewOrder {
        NewOrder::new("Alice")
            .with_item(NewOrderItem::new("pen", 2, 1.50))
            .with_item(NewOrderItem::new("ink", 1, 4.00))
            .with_payment(NewPayment::new(3.00, "card", "txn1"))
    }

    #[tokio::test]
    async fn create_order_task_persists_aggregate() {
        let fx = fixture().await;
        let id = fx.broker.submit_task::<CreateOrder>(&alice()).await.unwrap();

        assert_eq!(fx.worker.process_next().await.unwrap(), ProcessOutcome::Succeeded);

        let msg = fx.broker.task(id).await.unwrap().unwrap();
        let summary: CreatedOrderSummary = serde_json::from_value(msg.result.unwrap()).unwrap();
        assert_eq!(summary.total_amount, 7.0);
        assert_eq!(summary.items_count, 2);
        assert_eq!(summary.payments_count, 1);

        let stored = fx.orders.get_eager_batched(summary.order_id).await.unwrap().unwrap();
        assert_eq!(stored.customer_name, "Alice");
        assert_eq!(stored.items.as_slice().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn invalid_order_is_refused_at_submission() {
        let fx = fixture().await;

        let err = fx
            .broker
            .submit(
                "order.create",
                serde_json::json!({
                    "customer_name": "A",
                    "items": [{"product_name": "p", "quantity": 0, "price": -1}]
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(&err, BrokerError::InvalidArguments { task, reason }
            if task == "order.create" && reason.contains("quantity must be positive")));

        assert!(matches!(
            fx.broker.submit_task::<CreateOrder>(&NewOrder::new("")).await,
            Err(BrokerError::InvalidArguments { .. })
        ));
        assert_eq!(fx.broker.stats().await.unwrap().active(), 0);
        assert_eq!(fx.worker.process_next().await.unwrap(), ProcessOutcome::Idle);
    }

    #[tokio::test]
    async fn duplicate_transaction_is_rejected_not_retried() {
        let fx = fixture().await;
        fx.orders.create(&alice()).await.unwrap();

        let id = fx.broker.submit_task::<CreateOrder>(&alice()).await.unwrap();
        assert_eq!(fx.worker.process_next().await.unwrap(), ProcessOutcome::FailedTerminal);

        let msg = fx.broker.task(id).await.unwrap().unwrap();
        assert_eq!(msg.attempts, 0);
        assert_eq!(fx.orders.list(Default::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn process_order_marks_processed() {
        let fx = fixture().await;
        let order = fx.orders.create(&alice()).await.unwrap();

        let id = fx
            .broker
            .submit_task::<ProcessOrder>(&ProcessOrderArgs { order_id: order.id })
            .await
            .unwrap();
        assert_eq!(fx.worker.process_next().await.unwrap(), ProcessOutcome::Succeeded);

        let msg = fx.broker.task(id).await.unwrap().unwrap();
        let processed: ProcessedOrder = serde_json::from_value(msg.result.unwrap()).unwrap();
        assert_eq!(processed.items_count, 2);
        assert_eq!(processed.total_paid, 3.0);

        let stored = fx.orders.get_lazy(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Processed);
    }

    #[tokio::test]
    async fn process_missing_or_cancelled_order_is_terminal() {
        let fx = fixture().await;
        let order = fx.orders.create(&alice()).await.unwrap();
        fx.orders.update_status(order.id, OrderStatus::Cancelled).await.unwrap();

        let cancelled = fx
            .broker
            .submit_task::<ProcessOrder>(&ProcessOrderArgs { order_id: order.id })
            .await
            .unwrap();
        let missing = fx
            .broker
            .submit_task::<ProcessOrder>(&ProcessOrderArgs { order_id: OrderId::new(9999) })
            .await
            .unwrap();

        assert_eq!(fx.worker.process_next().await.unwrap(), ProcessOutcome::FailedTerminal);
        assert_eq!(fx.worker.process_next().await.unwrap(), ProcessOutcome::FailedTerminal);

        for id in [cancelled, missing] {
            let msg = fx.broker.task(id).await.unwrap().unwrap();
            assert_eq!(msg.status, TaskStatus::FailedTerminal);
        }
        let stored = fx.orders.get_lazy(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Cancelled);
    }
}
