//! Order aggregate repository.
//!
//! The parent row and both child collections are written in one transaction.
//! Reads pick a loading strategy:
//!
//! - **Lazy**: parent row only; children are `Children::NotLoaded`.
//! - **Batched**: parent, items and payments as three queries in one read
//!   transaction.
//! - **Joined**: one `LEFT JOIN` across both collections. The join yields
//!   `items × payments` rows per order; they are collapsed back to distinct
//!   children here.
//!
//! Lists fetch a page of parents and then one `IN (...)` query per child
//! collection, so the number of queries does not depend on the page size.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use thiserror::Error;
use tracing::{Span, debug, instrument};

use orderflow_core::{DomainError, OrderId, OrderItemId, PaymentId};
use orderflow_orders::{Children, NewOrder, NewPayment, Order, OrderItem, OrderStatus, Payment};

use super::{Database, DbError, map_sqlx_error};

const ORDER_COLUMNS: &str = "id, customer_name, total_amount, status, created_at";
const ITEM_COLUMNS: &str = "id, order_id, product_name, quantity, price";
const PAYMENT_COLUMNS: &str = "id, order_id, amount, payment_method, transaction_id, created_at";

/// How child collections are read alongside an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    #[default]
    Lazy,
    Batched,
    Joined,
}

pub const DEFAULT_PAGE_LIMIT: u32 = 100;
pub const MAX_PAGE_LIMIT: u32 = 1000;

/// Pagination parameters for order listings.
///
/// The limit never exceeds [`MAX_PAGE_LIMIT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pagination {
    limit: u32,
    offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(DEFAULT_PAGE_LIMIT).min(MAX_PAGE_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }
}

/// Result of recording a charge against an order.
#[derive(Debug, Clone, PartialEq)]
pub enum ChargeOutcome {
    /// Payment inserted and order marked processed.
    Charged(Payment),
    /// A payment with this transaction id already exists for the order.
    AlreadyCharged(Payment),
    OrderNotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Db(#[from] DbError),
}

/// Repository for the order aggregate.
#[derive(Debug, Clone)]
pub struct OrderRepository {
    db: Database,
}

impl OrderRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Validate and persist a complete aggregate in one transaction.
    ///
    /// Any failure, including a duplicate `transaction_id`, leaves no rows
    /// behind.
    #[instrument(
        skip(self, new_order),
        fields(
            customer = %new_order.customer_name,
            items = new_order.items.len(),
            payments = new_order.payments.len(),
            order_id
        ),
        err
    )]
    pub async fn create(&self, new_order: &NewOrder) -> Result<Order, RepositoryError> {
        new_order.validate()?;

        let total_amount = new_order.total_amount();
        let created_at = Utc::now();

        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let order_id = sqlx::query(
            "INSERT INTO orders (customer_name, total_amount, status, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&new_order.customer_name)
        .bind(total_amount)
        .bind(OrderStatus::Pending.as_str())
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_order", e))?
        .last_insert_rowid();
        let order_id = OrderId::new(order_id);
        Span::current().record("order_id", order_id.get());

        let mut items = Vec::with_capacity(new_order.items.len());
        for item in &new_order.items {
            let id = sqlx::query(
                "INSERT INTO order_items (order_id, product_name, quantity, price) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(order_id.get())
            .bind(&item.product_name)
            .bind(item.quantity)
            .bind(item.price)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_order_item", e))?
            .last_insert_rowid();

            items.push(OrderItem {
                id: OrderItemId::new(id),
                order_id,
                product_name: item.product_name.clone(),
                quantity: item.quantity,
                price: item.price,
            });
        }

        let mut payments = Vec::with_capacity(new_order.payments.len());
        for payment in &new_order.payments {
            payments.push(insert_payment(&mut tx, order_id, payment, created_at).await?);
        }

        // Dropping `tx` on any early return above rolls the whole aggregate back.
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        debug!(total_amount, "order created");

        Ok(Order {
            id: order_id,
            customer_name: new_order.customer_name.clone(),
            total_amount,
            status: OrderStatus::Pending,
            created_at,
            items: Children::Loaded(items),
            payments: Children::Loaded(payments),
        })
    }

    pub async fn get(
        &self,
        id: OrderId,
        strategy: LoadStrategy,
    ) -> Result<Option<Order>, RepositoryError> {
        match strategy {
            LoadStrategy::Lazy => self.get_lazy(id).await,
            LoadStrategy::Batched => self.get_eager_batched(id).await,
            LoadStrategy::Joined => self.get_eager_joined(id).await,
        }
    }

    /// Parent row only, in a single query.
    #[instrument(skip(self), fields(order_id = %id), err)]
    pub async fn get_lazy(&self, id: OrderId) -> Result<Option<Order>, RepositoryError> {
        let mut conn = self
            .db
            .pool()
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire_connection", e))?;
        Ok(fetch_order(&mut conn, id).await?)
    }

    /// Parent, items and payments as three queries in one read transaction.
    #[instrument(skip(self), fields(order_id = %id), err)]
    pub async fn get_eager_batched(&self, id: OrderId) -> Result<Option<Order>, RepositoryError> {
        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let Some(mut order) = fetch_order(&mut tx, id).await? else {
            return Ok(None);
        };
        order.items = Children::Loaded(fetch_items(&mut tx, &[id]).await?);
        order.payments = Children::Loaded(fetch_payments(&mut tx, &[id]).await?);

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(Some(order))
    }

    /// Whole aggregate from a single `LEFT JOIN` query.
    #[instrument(skip(self), fields(order_id = %id, rows), err)]
    pub async fn get_eager_joined(&self, id: OrderId) -> Result<Option<Order>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT o.id, o.customer_name, o.total_amount, o.status, o.created_at,
                   i.id AS item_id, i.product_name, i.quantity, i.price,
                   p.id AS payment_id, p.amount, p.payment_method, p.transaction_id,
                   p.created_at AS payment_created_at
            FROM orders o
            LEFT JOIN order_items i ON i.order_id = o.id
            LEFT JOIN payments p ON p.order_id = o.id
            WHERE o.id = ?1
            ORDER BY i.id, p.id
            "#,
        )
        .bind(id.get())
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| map_sqlx_error("get_order_joined", e))?;

        Span::current().record("rows", rows.len());

        let Some(first) = rows.first() else {
            return Ok(None);
        };
        let mut order = order_from_row(first).map_err(|e| map_sqlx_error("decode_order", e))?;

        let mut items = Vec::new();
        let mut payments = Vec::new();
        let mut seen_items = HashSet::new();
        let mut seen_payments = HashSet::new();

        for row in &rows {
            collapse_joined_row(row, id, &mut seen_items, &mut items, &mut seen_payments, &mut payments)
                .map_err(|e| map_sqlx_error("decode_joined_row", e))?;
        }

        order.items = Children::Loaded(items);
        order.payments = Children::Loaded(payments);
        Ok(Some(order))
    }

    /// Page of orders, newest first, without children.
    #[instrument(skip(self), err)]
    pub async fn list(&self, page: Pagination) -> Result<Vec<Order>, RepositoryError> {
        let mut conn = self
            .db
            .pool()
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire_connection", e))?;
        Ok(fetch_page(&mut conn, page).await?)
    }

    /// Page of orders with children, in three queries regardless of page size.
    #[instrument(skip(self), err)]
    pub async fn list_with_children(&self, page: Pagination) -> Result<Vec<Order>, RepositoryError> {
        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut orders = fetch_page(&mut tx, page).await?;
        if orders.is_empty() {
            return Ok(orders);
        }

        let ids: Vec<OrderId> = orders.iter().map(|o| o.id).collect();
        let mut items_by_order = group_by_order(fetch_items(&mut tx, &ids).await?, |i| i.order_id);
        let mut payments_by_order =
            group_by_order(fetch_payments(&mut tx, &ids).await?, |p| p.order_id);

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        for order in &mut orders {
            order.items = Children::Loaded(items_by_order.remove(&order.id).unwrap_or_default());
            order.payments =
                Children::Loaded(payments_by_order.remove(&order.id).unwrap_or_default());
        }
        Ok(orders)
    }

    /// Set the status of an order; `None` if it does not exist.
    #[instrument(skip(self), fields(order_id = %id, status = %status), err)]
    pub async fn update_status(
        &self,
        id: OrderId,
        status: OrderStatus,
    ) -> Result<Option<Order>, RepositoryError> {
        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let Some(mut order) = fetch_order(&mut tx, id).await? else {
            return Ok(None);
        };
        set_status(&mut tx, id, status).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        order.status = status;
        Ok(Some(order))
    }

    /// Record a payment and mark the order processed in one transaction.
    ///
    /// Re-recording the same transaction id for the same order is reported as
    /// `AlreadyCharged` without side effects. The same transaction id on a
    /// different order is a conflict.
    #[instrument(
        skip(self, payment),
        fields(order_id = %id, transaction_id = %payment.transaction_id),
        err
    )]
    pub async fn record_charge(
        &self,
        id: OrderId,
        payment: &NewPayment,
    ) -> Result<ChargeOutcome, RepositoryError> {
        payment.validate()?;

        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        if fetch_order(&mut tx, id).await?.is_none() {
            return Ok(ChargeOutcome::OrderNotFound);
        }

        let recorded = match insert_payment(&mut tx, id, payment, Utc::now()).await {
            Ok(recorded) => recorded,
            Err(DbError::Conflict(msg)) => {
                let existing = fetch_payment_by_transaction(&mut tx, &payment.transaction_id).await?;
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback_transaction", e))?;

                return match existing {
                    Some(existing) if existing.order_id == id => {
                        debug!(payment_id = %existing.id, "charge already recorded");
                        Ok(ChargeOutcome::AlreadyCharged(existing))
                    }
                    _ => Err(DbError::Conflict(msg).into()),
                };
            }
            Err(e) => return Err(e.into()),
        };

        set_status(&mut tx, id, OrderStatus::Processed).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        debug!(payment_id = %recorded.id, amount = recorded.amount, "charge recorded");
        Ok(ChargeOutcome::Charged(recorded))
    }

    /// Delete an order and, through the foreign keys, its children.
    #[instrument(skip(self), fields(order_id = %id), err)]
    pub async fn delete(&self, id: OrderId) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM orders WHERE id = ?1")
            .bind(id.get())
            .execute(self.db.pool())
            .await
            .map_err(|e| map_sqlx_error("delete_order", e))?;
        Ok(result.rows_affected() > 0)
    }

    /// Items of one order, for callers that loaded the parent lazily.
    #[instrument(skip(self), fields(order_id = %id), err)]
    pub async fn items_of(&self, id: OrderId) -> Result<Vec<OrderItem>, RepositoryError> {
        let mut conn = self
            .db
            .pool()
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire_connection", e))?;
        Ok(fetch_items(&mut conn, &[id]).await?)
    }

    /// Payments of one order, for callers that loaded the parent lazily.
    #[instrument(skip(self), fields(order_id = %id), err)]
    pub async fn payments_of(&self, id: OrderId) -> Result<Vec<Payment>, RepositoryError> {
        let mut conn = self
            .db
            .pool()
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire_connection", e))?;
        Ok(fetch_payments(&mut conn, &[id]).await?)
    }
}

async fn fetch_order(conn: &mut SqliteConnection, id: OrderId) -> Result<Option<Order>, DbError> {
    let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1"))
        .bind(id.get())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("get_order", e))?;

    row.map(|r| order_from_row(&r))
        .transpose()
        .map_err(|e| map_sqlx_error("decode_order", e))
}

async fn fetch_page(conn: &mut SqliteConnection, page: Pagination) -> Result<Vec<Order>, DbError> {
    let rows = sqlx::query(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2"
    ))
    .bind(i64::from(page.limit().min(MAX_PAGE_LIMIT)))
    .bind(i64::from(page.offset()))
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("list_orders", e))?;

    rows.iter()
        .map(order_from_row)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| map_sqlx_error("decode_order", e))
}

async fn fetch_items(
    conn: &mut SqliteConnection,
    order_ids: &[OrderId],
) -> Result<Vec<OrderItem>, DbError> {
    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new(format!("SELECT {ITEM_COLUMNS} FROM order_items WHERE order_id IN ("));
    let mut ids = qb.separated(", ");
    for id in order_ids {
        ids.push_bind(id.get());
    }
    ids.push_unseparated(") ORDER BY order_id, id");

    let rows = qb
        .build()
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("get_order_items", e))?;

    rows.iter()
        .map(item_from_row)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| map_sqlx_error("decode_order_item", e))
}

async fn fetch_payments(
    conn: &mut SqliteConnection,
    order_ids: &[OrderId],
) -> Result<Vec<Payment>, DbError> {
    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new(format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE order_id IN ("));
    let mut ids = qb.separated(", ");
    for id in order_ids {
        ids.push_bind(id.get());
    }
    ids.push_unseparated(") ORDER BY order_id, id");

    let rows = qb
        .build()
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("get_payments", e))?;

    rows.iter()
        .map(payment_from_row)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| map_sqlx_error("decode_payment", e))
}

async fn fetch_payment_by_transaction(
    conn: &mut SqliteConnection,
    transaction_id: &str,
) -> Result<Option<Payment>, DbError> {
    let row = sqlx::query(&format!(
        "SELECT {PAYMENT_COLUMNS} FROM payments WHERE transaction_id = ?1"
    ))
    .bind(transaction_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("get_payment_by_transaction", e))?;

    row.map(|r| payment_from_row(&r))
        .transpose()
        .map_err(|e| map_sqlx_error("decode_payment", e))
}

async fn insert_payment(
    conn: &mut SqliteConnection,
    order_id: OrderId,
    payment: &NewPayment,
    created_at: DateTime<Utc>,
) -> Result<Payment, DbError> {
    let id = sqlx::query(
        "INSERT INTO payments (order_id, amount, payment_method, transaction_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(order_id.get())
    .bind(payment.amount)
    .bind(&payment.payment_method)
    .bind(&payment.transaction_id)
    .bind(created_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_payment", e))?
    .last_insert_rowid();

    Ok(Payment {
        id: PaymentId::new(id),
        order_id,
        amount: payment.amount,
        payment_method: payment.payment_method.clone(),
        transaction_id: payment.transaction_id.clone(),
        created_at,
    })
}

async fn set_status(
    conn: &mut SqliteConnection,
    id: OrderId,
    status: OrderStatus,
) -> Result<(), DbError> {
    sqlx::query("UPDATE orders SET status = ?1 WHERE id = ?2")
        .bind(status.as_str())
        .bind(id.get())
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("update_order_status", e))?;
    Ok(())
}

fn group_by_order<T>(rows: Vec<T>, key: impl Fn(&T) -> OrderId) -> HashMap<OrderId, Vec<T>> {
    let mut grouped: HashMap<OrderId, Vec<T>> = HashMap::new();
    for row in rows {
        grouped.entry(key(&row)).or_default().push(row);
    }
    grouped
}

fn collapse_joined_row(
    row: &SqliteRow,
    order_id: OrderId,
    seen_items: &mut HashSet<i64>,
    items: &mut Vec<OrderItem>,
    seen_payments: &mut HashSet<i64>,
    payments: &mut Vec<Payment>,
) -> Result<(), sqlx::Error> {
    if let Some(item_id) = row.try_get::<Option<i64>, _>("item_id")? {
        if seen_items.insert(item_id) {
            items.push(OrderItem {
                id: OrderItemId::new(item_id),
                order_id,
                product_name: row.try_get("product_name")?,
                quantity: row.try_get("quantity")?,
                price: row.try_get("price")?,
            });
        }
    }

    if let Some(payment_id) = row.try_get::<Option<i64>, _>("payment_id")? {
        if seen_payments.insert(payment_id) {
            payments.push(Payment {
                id: PaymentId::new(payment_id),
                order_id,
                amount: row.try_get("amount")?,
                payment_method: row.try_get("payment_method")?,
                transaction_id: row.try_get("transaction_id")?,
                created_at: row.try_get("payment_created_at")?,
            });
        }
    }

    Ok(())
}

fn order_from_row(row: &SqliteRow) -> Result<Order, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<OrderStatus>()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

    Ok(Order {
        id: OrderId::new(row.try_get("id")?),
        customer_name: row.try_get("customer_name")?,
        total_amount: row.try_get("total_amount")?,
        status,
        created_at: row.try_get("created_at")?,
        items: Children::NotLoaded,
        payments: Children::NotLoaded,
    })
}

fn item_from_row(row: &SqliteRow) -> Result<OrderItem, sqlx::Error> {
    Ok(OrderItem {
        id: OrderItemId::new(row.try_get("id")?),
        order_id: OrderId::new(row.try_get("order_id")?),
        product_name: row.try_get("product_name")?,
        quantity: row.try_get("quantity")?,
        price: row.try_get("price")?,
    })
}

fn payment_from_row(row: &SqliteRow) -> Result<Payment, sqlx::Error> {
    Ok(Payment {
        id: PaymentId::new(row.try_get("id")?),
        order_id: OrderId::new(row.try_get("order_id")?),
        amount: row.try_get("amount")?,
        payment_method: row.try_get("payment_method")?,
        transaction_id: row.try_get("transaction_id")?,
        created_at: row.try_get("created_at")?,
    })
}
