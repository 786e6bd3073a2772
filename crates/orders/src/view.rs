//! Read views handed to callers outside the domain.

use chrono::{DateTime, Utc};
use serde::Serialize;

use orderflow_core::{OrderId, OrderItemId, PaymentId};

use crate::order::{Order, OrderItem, OrderStatus, Payment};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderItemView {
    pub id: OrderItemId,
    pub product_name: String,
    pub quantity: i64,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentView {
    pub id: PaymentId,
    pub amount: f64,
    pub payment_method: String,
    pub transaction_id: String,
    pub created_at: DateTime<Utc>,
}

/// Order as seen by callers. Child collections are present only when they
/// were loaded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderView {
    pub id: OrderId,
    pub customer_name: String,
    pub total_amount: f64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<OrderItemView>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payments: Option<Vec<PaymentView>>,
}

impl From<&OrderItem> for OrderItemView {
    fn from(item: &OrderItem) -> Self {
        Self {
            id: item.id,
            product_name: item.product_name.clone(),
            quantity: item.quantity,
            price: item.price,
        }
    }
}

impl From<&Payment> for PaymentView {
    fn from(payment: &Payment) -> Self {
        Self {
            id: payment.id,
            amount: payment.amount,
            payment_method: payment.payment_method.clone(),
            transaction_id: payment.transaction_id.clone(),
            created_at: payment.created_at,
        }
    }
}

impl From<&Order> for OrderView {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id,
            customer_name: order.customer_name.clone(),
            total_amount: order.total_amount,
            status: order.status,
            created_at: order.created_at,
            items: order
                .items
                .as_slice()
                .map(|items| items.iter().map(OrderItemView::from).collect()),
            payments: order
                .payments
                .as_slice()
                .map(|payments| payments.iter().map(PaymentView::from).collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::Children;

    fn order(items: Children<OrderItem>) -> Order {
        Order {
            id: OrderId::new(7),
            customer_name: "Alice".to_string(),
            total_amount: 3.0,
            status: OrderStatus::Pending,
            created_at: Utc::now(),
            items,
            payments: Children::NotLoaded,
        }
    }

    #[test]
    fn lazy_view_omits_children_from_json() {
        let view = OrderView::from(&order(Children::NotLoaded));
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["status"], "pending");
        assert!(json.get("items").is_none());
        assert!(json.get("payments").is_none());
    }

    #[test]
    fn loaded_children_are_rendered() {
        let item = OrderItem {
            id: OrderItemId::new(1),
            order_id: OrderId::new(7),
            product_name: "pen".to_string(),
            quantity: 2,
            price: 1.5,
        };
        let view = OrderView::from(&order(Children::Loaded(vec![item])));
        let items = view.items.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].product_name, "pen");
    }
}
