//! Table definitions, applied in order by `Database::migrate`.

pub(super) const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS orders (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        customer_name TEXT    NOT NULL,
        total_amount  REAL    NOT NULL DEFAULT 0,
        status        TEXT    NOT NULL DEFAULT 'pending'
                      CHECK (status IN ('pending', 'processed', 'cancelled')),
        created_at    TEXT    NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_orders_created_at ON orders (created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS order_items (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        order_id     INTEGER NOT NULL REFERENCES orders (id) ON DELETE CASCADE,
        product_name TEXT    NOT NULL,
        quantity     INTEGER NOT NULL CHECK (quantity > 0),
        price        REAL    NOT NULL CHECK (price >= 0)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_order_items_order_id ON order_items (order_id)",
    r#"
    CREATE TABLE IF NOT EXISTS payments (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        order_id       INTEGER NOT NULL REFERENCES orders (id) ON DELETE CASCADE,
        amount         REAL    NOT NULL CHECK (amount >= 0),
        payment_method TEXT    NOT NULL,
        transaction_id TEXT    NOT NULL UNIQUE,
        created_at     TEXT    NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_payments_order_id ON payments (order_id)",
    r#"
    CREATE TABLE IF NOT EXISTS task_queue (
        id           TEXT    PRIMARY KEY,
        name         TEXT    NOT NULL,
        args         TEXT    NOT NULL,
        attempts     INTEGER NOT NULL DEFAULT 0,
        retry_policy TEXT    NOT NULL,
        status       TEXT    NOT NULL,
        last_error   TEXT,
        result       TEXT,
        pipeline     TEXT,
        available_at INTEGER NOT NULL,
        created_at   INTEGER NOT NULL,
        updated_at   INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_task_queue_ready ON task_queue (status, available_at)",
];
