use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use orderflow_core::{AggregateRoot, DomainError, Entity, OrderId, OrderItemId, PaymentId};

/// Order status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Processed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Processed => "processed",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for OrderStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "processed" => Ok(OrderStatus::Processed),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(DomainError::validation(format!("unknown order status '{other}'"))),
        }
    }
}

/// A child collection that may or may not have been read from storage.
///
/// Lazy reads hand out `NotLoaded`; this is distinct from a loaded empty
/// collection.
#[derive(Debug, Clone, PartialEq)]
pub enum Children<T> {
    NotLoaded,
    Loaded(Vec<T>),
}

impl<T> Children<T> {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Children::Loaded(_))
    }

    /// Loaded children, or `None` when the collection was not read.
    pub fn as_slice(&self) -> Option<&[T]> {
        match self {
            Children::NotLoaded => None,
            Children::Loaded(v) => Some(v),
        }
    }
}

impl<T> Default for Children<T> {
    fn default() -> Self {
        Children::NotLoaded
    }
}

impl<T> From<Vec<T>> for Children<T> {
    fn from(value: Vec<T>) -> Self {
        Children::Loaded(value)
    }
}

/// Order line item (child entity).
#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub id: OrderItemId,
    pub order_id: OrderId,
    pub product_name: String,
    pub quantity: i64,
    pub price: f64,
}

impl Entity for OrderItem {
    type Id = OrderItemId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Payment recorded against an order (child entity).
#[derive(Debug, Clone, PartialEq)]
pub struct Payment {
    pub id: PaymentId,
    pub order_id: OrderId,
    pub amount: f64,
    pub payment_method: String,
    /// Unique across all payments.
    pub transaction_id: String,
    pub created_at: DateTime<Utc>,
}

impl Entity for Payment {
    type Id = PaymentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Aggregate root: Order.
///
/// `total_amount` is fixed when the order is created and is never recomputed
/// from the children on read.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub id: OrderId,
    pub customer_name: String,
    pub total_amount: f64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub items: Children<OrderItem>,
    pub payments: Children<Payment>,
}

impl Order {
    /// Sum of recorded payment amounts, if payments were loaded.
    pub fn total_paid(&self) -> Option<f64> {
        self.payments
            .as_slice()
            .map(|payments| payments.iter().map(|p| p.amount).sum())
    }

    pub fn is_pending(&self) -> bool {
        self.status == OrderStatus::Pending
    }
}

impl Entity for Order {
    type Id = OrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl AggregateRoot for Order {
    fn children_loaded(&self) -> bool {
        self.items.is_loaded() && self.payments.is_loaded()
    }
}
