//! Durable task queue persisted in SQLite.
//!
//! Messages live in the `task_queue` table created by `Database::migrate`.
//! Timestamps are stored as unix milliseconds; `args`, `result`,
//! `retry_policy` and `pipeline` as JSON text.
//!
//! Claiming is a single `UPDATE ... WHERE id = (SELECT ... LIMIT 1)
//! RETURNING` statement. SQLite takes the write lock before evaluating it, so
//! two workers can never claim the same row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::{debug, instrument};

use orderflow_core::TaskId;

use crate::db::{Database, DbError, map_sqlx_error};

use super::store::{QueueError, QueueStats, TaskQueue};
use super::types::{TaskMessage, TaskStatus};

const TASK_COLUMNS: &str = "id, name, args, attempts, retry_policy, status, last_error, result, pipeline, available_at, created_at, updated_at";

impl sqlx::Type<sqlx::Sqlite> for TaskStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <&str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for TaskStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<'r, sqlx::Sqlite>>::decode(value)?;
        Ok(s.parse::<TaskStatus>()?)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for TaskStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        let s = self.as_str();
        <&str as sqlx::Encode<'q, sqlx::Sqlite>>::encode_by_ref(&s, buf)
    }
}

/// SQLite-backed task queue.
///
/// Cheap to clone; shares the pool with the order repository.
#[derive(Debug, Clone)]
pub struct SqliteTaskQueue {
    db: Database,
}

impl SqliteTaskQueue {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TaskQueue for SqliteTaskQueue {
    #[instrument(skip(self, message), fields(task_id = %message.id, task = %message.name), err)]
    async fn enqueue(&self, message: TaskMessage) -> Result<TaskId, QueueError> {
        let mut conn = self
            .db
            .pool()
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire_connection", e))?;
        insert_message(&mut conn, &message).await?;
        Ok(message.id)
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskMessage>, QueueError> {
        let mut conn = self
            .db
            .pool()
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire_connection", e))?;
        fetch_message(&mut conn, id).await
    }

    #[instrument(skip(self), err)]
    async fn claim_next(&self) -> Result<Option<TaskMessage>, QueueError> {
        let now = Utc::now().timestamp_millis();

        let row = sqlx::query(&format!(
            r#"
            UPDATE task_queue
            SET status = ?1, updated_at = ?2
            WHERE id = (
                SELECT id FROM task_queue
                WHERE status IN (?3, ?4) AND available_at <= ?2
                ORDER BY available_at, id
                LIMIT 1
            )
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(TaskStatus::Running)
        .bind(now)
        .bind(TaskStatus::Queued)
        .bind(TaskStatus::FailedRetryable)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| map_sqlx_error("claim_task", e))?;

        row.map(|r| message_from_row(&r)).transpose()
    }

    #[instrument(skip(self, result, continuation), fields(task_id = %id), err)]
    async fn complete(
        &self,
        id: TaskId,
        result: JsonValue,
        continuation: Option<TaskMessage>,
    ) -> Result<(), QueueError> {
        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let updated = sqlx::query(
            "UPDATE task_queue SET status = ?1, result = ?2, updated_at = ?3 WHERE id = ?4 AND status = ?5",
        )
        .bind(TaskStatus::Succeeded)
        .bind(result.to_string())
        .bind(Utc::now().timestamp_millis())
        .bind(id.to_string())
        .bind(TaskStatus::Running)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("complete_task", e))?
        .rows_affected();

        if updated == 0 {
            return Err(not_running_or_missing(&mut tx, id).await);
        }

        if let Some(next) = &continuation {
            insert_message(&mut tx, next).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        if let Some(next) = continuation {
            debug!(next_task_id = %next.id, next_task = %next.name, "continuation enqueued");
        }
        Ok(())
    }

    #[instrument(skip(self, error), fields(task_id = %id), err)]
    async fn retry(&self, id: TaskId, error: String) -> Result<TaskMessage, QueueError> {
        let mut msg = self.running(id).await?;
        msg.mark_retry(error, Utc::now());
        self.store_failure(msg).await
    }

    #[instrument(skip(self, error), fields(task_id = %id), err)]
    async fn fail(&self, id: TaskId, error: String) -> Result<TaskMessage, QueueError> {
        let mut msg = self.running(id).await?;
        msg.mark_failed(error, Utc::now());
        self.store_failure(msg).await
    }

    async fn list_failed(&self, limit: usize) -> Result<Vec<TaskMessage>, QueueError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM task_queue WHERE status = ?1 ORDER BY updated_at DESC, id DESC LIMIT ?2"
        ))
        .bind(TaskStatus::FailedTerminal)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| map_sqlx_error("list_failed_tasks", e))?;

        rows.iter().map(message_from_row).collect()
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM task_queue GROUP BY status")
            .fetch_all(self.db.pool())
            .await
            .map_err(|e| map_sqlx_error("task_stats", e))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: TaskStatus = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("decode_task_stats", e))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|e| map_sqlx_error("decode_task_stats", e))?;
            stats.count(status, usize::try_from(n).unwrap_or_default());
        }
        Ok(stats)
    }

    #[instrument(skip(self), err)]
    async fn requeue_running(&self) -> Result<usize, QueueError> {
        let now = Utc::now().timestamp_millis();
        let requeued = sqlx::query(
            "UPDATE task_queue SET status = ?1, available_at = ?2, updated_at = ?2 WHERE status = ?3",
        )
        .bind(TaskStatus::Queued)
        .bind(now)
        .bind(TaskStatus::Running)
        .execute(self.db.pool())
        .await
        .map_err(|e| map_sqlx_error("requeue_running_tasks", e))?
        .rows_affected();

        Ok(usize::try_from(requeued).unwrap_or(usize::MAX))
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn requeue(&self, id: TaskId) -> Result<(), QueueError> {
        let mut conn = self
            .db
            .pool()
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire_connection", e))?;

        let now = Utc::now().timestamp_millis();
        let updated = sqlx::query(
            "UPDATE task_queue SET status = ?1, available_at = ?2, updated_at = ?2 WHERE id = ?3 AND status = ?4",
        )
        .bind(TaskStatus::Queued)
        .bind(now)
        .bind(id.to_string())
        .bind(TaskStatus::Running)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("requeue_task", e))?
        .rows_affected();

        if updated == 0 {
            return Err(not_running_or_missing(&mut conn, id).await);
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize, QueueError> {
        let purged = sqlx::query(
            "DELETE FROM task_queue WHERE status IN (?1, ?2) AND updated_at < ?3",
        )
        .bind(TaskStatus::Succeeded)
        .bind(TaskStatus::FailedTerminal)
        .bind(before.timestamp_millis())
        .execute(self.db.pool())
        .await
        .map_err(|e| map_sqlx_error("purge_finished_tasks", e))?
        .rows_affected();

        Ok(usize::try_from(purged).unwrap_or(usize::MAX))
    }
}

impl SqliteTaskQueue {
    async fn running(&self, id: TaskId) -> Result<TaskMessage, QueueError> {
        match self.get(id).await? {
            Some(msg) if msg.status == TaskStatus::Running => Ok(msg),
            Some(_) => Err(QueueError::NotRunning(id)),
            None => Err(QueueError::NotFound(id)),
        }
    }

    /// Persist a failure computed in memory, guarded by the `running` status.
    async fn store_failure(&self, msg: TaskMessage) -> Result<TaskMessage, QueueError> {
        let updated = sqlx::query(
            r#"
            UPDATE task_queue
            SET status = ?1, attempts = ?2, last_error = ?3, available_at = ?4, updated_at = ?5
            WHERE id = ?6 AND status = ?7
            "#,
        )
        .bind(msg.status)
        .bind(i64::from(msg.attempts))
        .bind(msg.last_error.as_deref())
        .bind(msg.available_at.timestamp_millis())
        .bind(msg.updated_at.timestamp_millis())
        .bind(msg.id.to_string())
        .bind(TaskStatus::Running)
        .execute(self.db.pool())
        .await
        .map_err(|e| map_sqlx_error("record_task_failure", e))?
        .rows_affected();

        if updated == 0 {
            return Err(QueueError::NotRunning(msg.id));
        }
        Ok(msg)
    }
}

async fn insert_message(conn: &mut SqliteConnection, msg: &TaskMessage) -> Result<(), QueueError> {
    let retry_policy = serde_json::to_string(&msg.retry_policy)
        .map_err(|e| QueueError::Corrupt(format!("retry policy: {e}")))?;
    let pipeline = msg
        .pipeline
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| QueueError::Corrupt(format!("pipeline cursor: {e}")))?;

    sqlx::query(&format!(
        "INSERT INTO task_queue ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
    ))
    .bind(msg.id.to_string())
    .bind(&msg.name)
    .bind(msg.args.to_string())
    .bind(i64::from(msg.attempts))
    .bind(retry_policy)
    .bind(msg.status)
    .bind(msg.last_error.as_deref())
    .bind(msg.result.as_ref().map(JsonValue::to_string))
    .bind(pipeline)
    .bind(msg.available_at.timestamp_millis())
    .bind(msg.created_at.timestamp_millis())
    .bind(msg.updated_at.timestamp_millis())
    .execute(&mut *conn)
    .await
    .map_err(|e| match map_sqlx_error("enqueue_task", e) {
        DbError::Conflict(_) => QueueError::AlreadyExists(msg.id),
        other => QueueError::Db(other),
    })?;

    Ok(())
}

async fn fetch_message(
    conn: &mut SqliteConnection,
    id: TaskId,
) -> Result<Option<TaskMessage>, QueueError> {
    let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM task_queue WHERE id = ?1"))
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("get_task", e))?;

    row.map(|r| message_from_row(&r)).transpose()
}

async fn not_running_or_missing(conn: &mut SqliteConnection, id: TaskId) -> QueueError {
    match fetch_message(conn, id).await {
        Ok(Some(_)) => QueueError::NotRunning(id),
        Ok(None) => QueueError::NotFound(id),
        Err(e) => e,
    }
}

fn message_from_row(row: &SqliteRow) -> Result<TaskMessage, QueueError> {
    let decode = |e| QueueError::Db(map_sqlx_error("decode_task", e));

    let id: String = row.try_get("id").map_err(decode)?;
    let id = id
        .parse::<TaskId>()
        .map_err(|e| QueueError::Corrupt(format!("task id '{id}': {e}")))?;

    let args: String = row.try_get("args").map_err(decode)?;
    let retry_policy: String = row.try_get("retry_policy").map_err(decode)?;
    let result: Option<String> = row.try_get("result").map_err(decode)?;
    let pipeline: Option<String> = row.try_get("pipeline").map_err(decode)?;
    let attempts: i64 = row.try_get("attempts").map_err(decode)?;

    Ok(TaskMessage {
        id,
        name: row.try_get("name").map_err(decode)?,
        args: parse_json(id, "args", &args)?,
        attempts: u32::try_from(attempts)
            .map_err(|_| QueueError::Corrupt(format!("task {id}: attempts {attempts}")))?,
        retry_policy: parse_json(id, "retry_policy", &retry_policy)?,
        status: row.try_get("status").map_err(decode)?,
        last_error: row.try_get("last_error").map_err(decode)?,
        result: result.map(|r| parse_json(id, "result", &r)).transpose()?,
        pipeline: pipeline.map(|p| parse_json(id, "pipeline", &p)).transpose()?,
        available_at: millis(id, row.try_get("available_at").map_err(decode)?)?,
        created_at: millis(id, row.try_get("created_at").map_err(decode)?)?,
        updated_at: millis(id, row.try_get("updated_at").map_err(decode)?)?,
    })
}

fn parse_json<T: serde::de::DeserializeOwned>(
    id: TaskId,
    column: &str,
    raw: &str,
) -> Result<T, QueueError> {
    serde_json::from_str(raw).map_err(|e| QueueError::Corrupt(format!("task {id} {column}: {e}")))
}

fn millis(id: TaskId, ms: i64) -> Result<DateTime<Utc>, QueueError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| QueueError::Corrupt(format!("task {id}: timestamp {ms} out of range")))
}
