//! The two steps of the `order.checkout` pipeline.
//!
//! `order.validate` reads the order and decides whether it can be charged;
//! its output is the argument of `payment.charge`. The charge records a
//! payment and marks the order processed in one repository transaction. Its
//! transaction id is derived from the pipeline run, so a redelivered charge
//! finds the existing payment instead of charging twice.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use orderflow_core::OrderId;
use orderflow_orders::NewPayment;

use crate::db::{ChargeOutcome, OrderRepository};
use crate::jobs::{Task, TaskContext, TaskError};

const PAYMENT_METHOD: &str = "card";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateOrderArgs {
    pub order_id: OrderId,
    pub user_name: String,
}

/// Output of `order.validate`, argument of `payment.charge`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeArgs {
    pub order_id: OrderId,
    pub amount: f64,
    pub validated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeReceipt {
    pub order_id: OrderId,
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub amount_charged: f64,
    /// The payment had already been recorded by an earlier delivery.
    #[serde(default)]
    pub duplicate: bool,
}

impl ChargeReceipt {
    fn skipped(order_id: OrderId) -> Self {
        Self {
            order_id,
            skipped: true,
            transaction_id: None,
            amount_charged: 0.0,
            duplicate: false,
        }
    }
}

pub struct ValidateOrder {
    orders: OrderRepository,
}

impl ValidateOrder {
    pub fn new(orders: OrderRepository) -> Self {
        Self { orders }
    }
}

#[async_trait]
impl Task for ValidateOrder {
    const NAME: &'static str = "order.validate";
    type Args = ValidateOrderArgs;
    type Output = ChargeArgs;

    #[instrument(
        name = "order.validate",
        skip_all,
        fields(order_id = %args.order_id, user = %args.user_name)
    )]
    async fn run(&self, _ctx: TaskContext, args: ValidateOrderArgs) -> Result<ChargeArgs, TaskError> {
        let Some(order) = self.orders.get_lazy(args.order_id).await? else {
            return Err(TaskError::rejected(format!("order {} not found", args.order_id)));
        };

        let validated = order.is_pending();
        if validated {
            info!(amount = order.total_amount, "order validated");
        } else {
            warn!(status = %order.status, "order is not pending, charge will be skipped");
        }

        Ok(ChargeArgs {
            order_id: order.id,
            amount: order.total_amount,
            validated,
        })
    }
}

pub struct ChargePayment {
    orders: OrderRepository,
}

impl ChargePayment {
    pub fn new(orders: OrderRepository) -> Self {
        Self { orders }
    }
}

#[async_trait]
impl Task for ChargePayment {
    const NAME: &'static str = "payment.charge";
    type Args = ChargeArgs;
    type Output = ChargeReceipt;

    #[instrument(name = "payment.charge", skip_all, fields(order_id = %args.order_id))]
    async fn run(&self, ctx: TaskContext, args: ChargeArgs) -> Result<ChargeReceipt, TaskError> {
        if !args.validated {
            info!("order not validated, skipping charge");
            return Ok(ChargeReceipt::skipped(args.order_id));
        }

        // Stable across redeliveries of this step.
        let transaction_id = match ctx.pipeline() {
            Some(cursor) => format!("txn-{}", cursor.run_id),
            None => format!("txn-{}", ctx.task_id()),
        };
        let payment = NewPayment::new(args.amount, PAYMENT_METHOD, transaction_id.clone());

        let (payment, duplicate) = match self.orders.record_charge(args.order_id, &payment).await? {
            ChargeOutcome::Charged(payment) => (payment, false),
            ChargeOutcome::AlreadyCharged(payment) => (payment, true),
            ChargeOutcome::OrderNotFound => {
                return Err(TaskError::rejected(format!(
                    "order {} not found",
                    args.order_id
                )));
            }
        };
        info!(%transaction_id, amount = payment.amount, duplicate, "payment recorded");

        Ok(ChargeReceipt {
            order_id: args.order_id,
            skipped: false,
            transaction_id: Some(payment.transaction_id),
            amount_charged: payment.amount,
            duplicate,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use orderflow_orders::{NewOrder, NewOrderItem, OrderStatus};

    use super::*;
    use crate::db::Database;
    use crate::jobs::{
        Broker, InMemoryTaskQueue, ProcessOutcome, TaskRegistry, TaskStatus, Worker, WorkerConfig,
    };
    use crate::tasks::{CHECKOUT_PIPELINE, register_all};

    struct Fixture {
        orders: OrderRepository,
        broker: Broker,
        worker: Worker,
    }

    async fn fixture() -> Fixture {
        let db = Database::connect_in_memory().await.unwrap();
        let orders = OrderRepository::new(db);

        let mut registry = TaskRegistry::new();
        register_all(&mut registry, orders.clone()).unwrap();
        let broker = Broker::new(InMemoryTaskQueue::arc(), Arc::new(registry));
        let worker = Worker::new(broker.clone(), WorkerConfig::default());

        Fixture { orders, broker, worker }
    }

    async fn pending_order(orders: &OrderRepository) -> OrderId {
        let new = NewOrder::new("Alice").with_item(NewOrderItem::new("pen", 2, 1.50));
        orders.create(&new).await.unwrap().id
    }

    fn checkout_args(order_id: OrderId) -> serde_json::Value {
        serde_json::json!({ "order_id": order_id, "user_name": "alice" })
    }

    #[tokio::test]
    async fn checkout_enqueues_exactly_one_validated_charge() {
        let fx = fixture().await;
        let order_id = pending_order(&fx.orders).await;
        fx.broker
            .start_pipeline(CHECKOUT_PIPELINE, checkout_args(order_id))
            .await
            .unwrap();

        assert_eq!(fx.worker.process_next().await.unwrap(), ProcessOutcome::Succeeded);

        let stats = fx.broker.stats().await.unwrap();
        assert_eq!((stats.succeeded, stats.queued), (1, 1));

        // Peek at the continuation, then hand it back to the queue.
        let charge = fx.broker.claim().await.unwrap().unwrap();
        assert_eq!(charge.name, "payment.charge");
        assert_eq!(
            charge.args,
            serde_json::json!({ "order_id": order_id, "amount": 3.0, "validated": true })
        );
        assert_eq!(charge.pipeline.as_ref().unwrap().step, 1);
        assert!(fx.broker.claim().await.unwrap().is_none());
        assert_eq!(fx.broker.recover_orphaned().await.unwrap(), 1);

        assert_eq!(fx.worker.process_next().await.unwrap(), ProcessOutcome::Succeeded);
        assert_eq!(fx.worker.process_next().await.unwrap(), ProcessOutcome::Idle);

        let charged = fx.broker.task(charge.id).await.unwrap().unwrap();
        let receipt: ChargeReceipt = serde_json::from_value(charged.result.unwrap()).unwrap();
        assert!(!receipt.skipped);
        assert_eq!(receipt.amount_charged, 3.0);

        let order = fx.orders.get_eager_batched(order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Processed);
        let payments = order.payments.as_slice().unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(Some(&payments[0].transaction_id), receipt.transaction_id.as_ref());
    }

    #[tokio::test]
    async fn unvalidated_charge_has_no_side_effect() {
        let fx = fixture().await;
        let order_id = pending_order(&fx.orders).await;
        fx.orders.update_status(order_id, OrderStatus::Cancelled).await.unwrap();

        fx.broker
            .start_pipeline(CHECKOUT_PIPELINE, checkout_args(order_id))
            .await
            .unwrap();
        assert_eq!(fx.worker.process_next().await.unwrap(), ProcessOutcome::Succeeded);
        assert_eq!(fx.worker.process_next().await.unwrap(), ProcessOutcome::Succeeded);

        assert!(fx.orders.payments_of(order_id).await.unwrap().is_empty());
        let order = fx.orders.get_lazy(order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn redelivered_charge_does_not_charge_twice() {
        let fx = fixture().await;
        let order_id = pending_order(&fx.orders).await;
        let args = ChargeArgs {
            order_id,
            amount: 3.0,
            validated: true,
        };

        let id = fx.broker.submit_task::<ChargePayment>(&args).await.unwrap();
        let message = fx.broker.claim().await.unwrap().unwrap();
        let ctx = TaskContext::for_message(&message, fx.broker.clone());
        let task = ChargePayment::new(fx.orders.clone());

        let first = task.run(ctx.clone(), args.clone()).await.unwrap();
        let second = task.run(ctx, args).await.unwrap();

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.transaction_id, second.transaction_id);
        assert_eq!(first.transaction_id, Some(format!("txn-{id}")));
        assert_eq!(fx.orders.payments_of(order_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_order_stops_the_pipeline() {
        let fx = fixture().await;
        let id = fx
            .broker
            .start_pipeline(CHECKOUT_PIPELINE, checkout_args(OrderId::new(9999)))
            .await
            .unwrap();

        assert_eq!(fx.worker.process_next().await.unwrap(), ProcessOutcome::FailedTerminal);
        assert_eq!(fx.worker.process_next().await.unwrap(), ProcessOutcome::Idle);

        let msg = fx.broker.task(id).await.unwrap().unwrap();
        assert_eq!(msg.status, TaskStatus::FailedTerminal);
        assert!(msg.last_error.unwrap().contains("not found"));
    }
}
