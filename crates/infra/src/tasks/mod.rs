//! Task handlers for the order domain and the pipelines built from them.
//!
//! | name | args | notes |
//! |------|------|-------|
//! | `message.repeat` | `{ message, repeat }` | standalone, no IO |
//! | `order.create` | `NewOrder` | one repository transaction |
//! | `order.process` | `{ order_id }` | lazy check, batched load, status update |
//! | `order.validate` | `{ order_id, user_name }` | step 0 of `order.checkout` |
//! | `payment.charge` | `{ order_id, amount, validated }` | step 1 of `order.checkout` |

pub mod checkout;
pub mod messages;
pub mod orders;

pub use checkout::{ChargeArgs, ChargePayment, ChargeReceipt, ValidateOrder, ValidateOrderArgs};
pub use messages::{RepeatArgs, RepeatMessage};
pub use orders::{CreateOrder, CreatedOrderSummary, ProcessOrder, ProcessOrderArgs, ProcessedOrder};

use crate::db::{DbError, OrderRepository, RepositoryError};
use crate::jobs::{BrokerError, RegistryError, TaskError, TaskRegistry};
use crate::pipeline::Pipeline;

/// Validate an order, then charge it.
pub const CHECKOUT_PIPELINE: &str = "order.checkout";

/// Register every task handler and pipeline of the order domain.
pub fn register_all(
    registry: &mut TaskRegistry,
    orders: OrderRepository,
) -> Result<(), RegistryError> {
    registry.register(RepeatMessage)?;
    registry.register(CreateOrder::new(orders.clone()))?;
    registry.register(ProcessOrder::new(orders.clone()))?;
    registry.register(ValidateOrder::new(orders.clone()))?;
    registry.register(ChargePayment::new(orders))?;

    registry.register_pipeline(
        Pipeline::new(CHECKOUT_PIPELINE)
            .step::<ValidateOrder>()
            .step::<ChargePayment>(),
    )
}

impl From<RepositoryError> for TaskError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Domain(e) => TaskError::rejected(e.to_string()),
            RepositoryError::Db(e @ (DbError::Conflict(_) | DbError::Constraint(_))) => {
                TaskError::rejected(e.to_string())
            }
            RepositoryError::Db(e) => TaskError::failed(e.to_string()),
        }
    }
}

impl From<BrokerError> for TaskError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Queue(e) => TaskError::failed(e.to_string()),
            other => TaskError::rejected(other.to_string()),
        }
    }
}
