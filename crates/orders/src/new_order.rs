//! Input accepted when creating an order aggregate.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use orderflow_core::{DomainError, DomainResult};

const MAX_CUSTOMER_NAME: usize = 100;
const MAX_PRODUCT_NAME: usize = 200;
const MAX_PAYMENT_METHOD: usize = 50;
const MAX_TRANSACTION_ID: usize = 100;

/// Line item to create alongside a new order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOrderItem {
    pub product_name: String,
    pub quantity: i64,
    pub price: f64,
}

impl NewOrderItem {
    pub fn new(product_name: impl Into<String>, quantity: i64, price: f64) -> Self {
        Self {
            product_name: product_name.into(),
            quantity,
            price,
        }
    }
}

/// Payment to record alongside a new order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPayment {
    pub amount: f64,
    pub payment_method: String,
    pub transaction_id: String,
}

impl NewPayment {
    pub fn new(amount: f64, payment_method: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self {
            amount,
            payment_method: payment_method.into(),
            transaction_id: transaction_id.into(),
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if !self.amount.is_finite() || self.amount < 0.0 {
            return Err(DomainError::validation("payment amount must be a non-negative number"));
        }
        check_text("payment_method", &self.payment_method, MAX_PAYMENT_METHOD)?;
        check_text("transaction_id", &self.transaction_id, MAX_TRANSACTION_ID)
    }
}

/// A complete order aggregate to be persisted in one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOrder {
    pub customer_name: String,
    #[serde(default)]
    pub items: Vec<NewOrderItem>,
    #[serde(default)]
    pub payments: Vec<NewPayment>,
}

impl NewOrder {
    pub fn new(customer_name: impl Into<String>) -> Self {
        Self {
            customer_name: customer_name.into(),
            items: Vec::new(),
            payments: Vec::new(),
        }
    }

    pub fn with_item(mut self, item: NewOrderItem) -> Self {
        self.items.push(item);
        self
    }

    pub fn with_payment(mut self, payment: NewPayment) -> Self {
        self.payments.push(payment);
        self
    }

    /// Sum of `quantity × price` over all items.
    ///
    /// This is the only place an order total is computed.
    pub fn total_amount(&self) -> f64 {
        self.items
            .iter()
            .map(|item| item.quantity as f64 * item.price)
            .sum()
    }

    pub fn validate(&self) -> DomainResult<()> {
        check_text("customer_name", &self.customer_name, MAX_CUSTOMER_NAME)?;

        for (idx, item) in self.items.iter().enumerate() {
            check_text("product_name", &item.product_name, MAX_PRODUCT_NAME)
                .map_err(|e| at_index("items", idx, e))?;
            if item.quantity <= 0 {
                return Err(at_index(
                    "items",
                    idx,
                    DomainError::validation("quantity must be positive"),
                ));
            }
            if !item.price.is_finite() || item.price < 0.0 {
                return Err(at_index(
                    "items",
                    idx,
                    DomainError::validation("price must be a non-negative number"),
                ));
            }
        }

        let mut seen = HashSet::new();
        for (idx, payment) in self.payments.iter().enumerate() {
            payment.validate().map_err(|e| at_index("payments", idx, e))?;
            if !seen.insert(payment.transaction_id.as_str()) {
                return Err(at_index(
                    "payments",
                    idx,
                    DomainError::conflict(format!(
                        "duplicate transaction_id '{}'",
                        payment.transaction_id
                    )),
                ));
            }
        }

        Ok(())
    }
}

fn check_text(field: &str, value: &str, max: usize) -> DomainResult<()> {
    if value.trim().is_empty() {
        return Err(DomainError::validation(format!("{field} must not be empty")));
    }
    if value.chars().count() > max {
        return Err(DomainError::validation(format!(
            "{field} must be at most {max} characters"
        )));
    }
    Ok(())
}

fn at_index(collection: &str, idx: usize, err: DomainError) -> DomainError {
    match err {
        DomainError::Validation(msg) => DomainError::validation(format!("{collection}[{idx}]: {msg}")),
        DomainError::Conflict(msg) => DomainError::conflict(format!("{collection}[{idx}]: {msg}")),
        other => other,
    }
}
