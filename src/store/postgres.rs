//! PostgreSQL [`TaskStore`] shared by every server instance.
//!
//! Cancellation notices go out with `pg_notify` on [`CANCEL_CHANNEL`]; each
//! instance keeps one dedicated listener connection and fans notices out to
//! the callbacks registered for tasks it runs.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use std::time::Duration as StdDuration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    cancel_precheck, CancelCallback, CancelListeners, CancelOutcome, CancelSubscription, ListFilter,
    TaskRecord, TaskStatus, TaskStore, TaskUpdate, CANCEL_CHANNEL,
};
use crate::context::Message;
use crate::error::{StoreError, StoreResult};

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS agent_tasks (
        task_id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        query TEXT NOT NULL,
        max_steps INTEGER NOT NULL,
        final_state TEXT,
        execution_statistics JSONB,
        sandbox_info JSONB,
        request_data JSONB,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    // columns added after the first schema revision
    "ALTER TABLE agent_tasks ADD COLUMN IF NOT EXISTS finished_output TEXT",
    "ALTER TABLE agent_tasks ADD COLUMN IF NOT EXISTS llm_context JSONB",
    "ALTER TABLE agent_tasks ADD COLUMN IF NOT EXISTS cancel_requested BOOLEAN NOT NULL DEFAULT FALSE",
    "ALTER TABLE agent_tasks ADD COLUMN IF NOT EXISTS cancelled_at TIMESTAMPTZ",
    "CREATE INDEX IF NOT EXISTS idx_agent_tasks_status ON agent_tasks (status)",
    "CREATE INDEX IF NOT EXISTS idx_agent_tasks_created_at ON agent_tasks (created_at)",
    "CREATE INDEX IF NOT EXISTS idx_agent_tasks_cancel ON agent_tasks (cancel_requested) WHERE cancel_requested = TRUE",
];

const COLUMNS: &str = "task_id, status, query, max_steps, final_state, execution_statistics, \
    sandbox_info, request_data, created_at, updated_at, finished_output, llm_context, \
    cancel_requested, cancelled_at";

pub struct PgTaskStore {
    pool: PgPool,
    listeners: CancelListeners,
    listener_task: Option<JoinHandle<()>>,
}

impl PgTaskStore {
    /// Connects, applies the schema and starts the notification listener.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(StdDuration::from_secs(10))
            .connect(url)
            .await?;
        let mut store = Self::from_pool(pool);
        store.migrate().await?;
        store.start_listener().await?;
        Ok(store)
    }

    /// Wraps an existing pool without listening for notices.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool, listeners: CancelListeners::new(), listener_task: None }
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        info!("agent_tasks schema ready");
        Ok(())
    }

    async fn start_listener(&mut self) -> StoreResult<()> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CANCEL_CHANNEL).await?;
        let listeners = self.listeners.clone();
        self.listener_task = Some(tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(n) => {
                        let task_id = n.payload();
                        debug!(task_id, "received cancel notification");
                        listeners.dispatch(task_id).await;
                    }
                    Err(e) => {
                        // PgListener reconnects on the next recv
                        warn!(error = %e, "cancel listener error");
                        tokio::time::sleep(StdDuration::from_secs(1)).await;
                    }
                }
            }
        }));
        info!("started cancel notification listener");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl Drop for PgTaskStore {
    fn drop(&mut self) {
        if let Some(t) = self.listener_task.take() {
            t.abort();
        }
    }
}

/// `max_steps` as stored in the INTEGER column.
fn steps_column(task_id: &str, max_steps: u32) -> StoreResult<i32> {
    i32::try_from(max_steps)
        .map_err(|_| StoreError::Backend(format!("task {task_id}: max_steps {max_steps} out of range")))
}

fn record_from_row(row: &PgRow) -> StoreResult<TaskRecord> {
    let status: String = row.try_get("status")?;
    let max_steps: i32 = row.try_get("max_steps")?;
    let execution_statistics: Option<Json<Value>> = row.try_get("execution_statistics")?;
    let sandbox_info: Option<Json<Value>> = row.try_get("sandbox_info")?;
    let request_data: Option<Json<Value>> = row.try_get("request_data")?;
    let llm_context: Option<Json<Vec<Message>>> = row.try_get("llm_context")?;
    Ok(TaskRecord {
        task_id: row.try_get("task_id")?,
        status: status.parse()?,
        query: row.try_get("query")?,
        max_steps: u32::try_from(max_steps).unwrap_or_default(),
        final_state: row.try_get("final_state")?,
        execution_statistics: execution_statistics.map(|j| j.0),
        sandbox_info: sandbox_info.map(|j| j.0),
        request_data: request_data.map(|j| j.0),
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        finished_output: row.try_get("finished_output")?,
        llm_context: llm_context.map(|j| j.0),
        cancel_requested: row.try_get("cancel_requested")?,
        cancelled_at: row.try_get("cancelled_at")?,
    })
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn create(&self, rec: TaskRecord) -> StoreResult<()> {
        let result = sqlx::query(
            "INSERT INTO agent_tasks (task_id, status, query, max_steps, final_state, \
             execution_statistics, sandbox_info, request_data, created_at, updated_at, \
             finished_output, llm_context, cancel_requested, cancelled_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
             ON CONFLICT (task_id) DO NOTHING",
        )
        .bind(&rec.task_id)
        .bind(rec.status.as_str())
        .bind(&rec.query)
        .bind(steps_column(&rec.task_id, rec.max_steps)?)
        .bind(&rec.final_state)
        .bind(rec.execution_statistics.as_ref().map(Json))
        .bind(rec.sandbox_info.as_ref().map(Json))
        .bind(rec.request_data.as_ref().map(Json))
        .bind(rec.created_at)
        .bind(rec.updated_at)
        .bind(&rec.finished_output)
        .bind(rec.llm_context.as_ref().map(Json))
        .bind(rec.cancel_requested)
        .bind(rec.cancelled_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(rec.task_id));
        }
        debug!(task_id = %rec.task_id, "task created");
        Ok(())
    }

    async fn get(&self, task_id: &str) -> StoreResult<Option<TaskRecord>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM agent_tasks WHERE task_id = $1"))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn update(&self, task_id: &str, update: TaskUpdate) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM agent_tasks WHERE task_id = $1 FOR UPDATE"))
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let mut rec = record_from_row(&row)?;
        update.apply(&mut rec)?;

        sqlx::query(
            "UPDATE agent_tasks SET status = $2, query = $3, max_steps = $4, final_state = $5, \
             execution_statistics = $6, sandbox_info = $7, updated_at = $8, finished_output = $9, \
             llm_context = $10, cancel_requested = $11, cancelled_at = $12 WHERE task_id = $1",
        )
        .bind(task_id)
        .bind(rec.status.as_str())
        .bind(&rec.query)
        .bind(steps_column(task_id, rec.max_steps)?)
        .bind(&rec.final_state)
        .bind(rec.execution_statistics.as_ref().map(Json))
        .bind(rec.sandbox_info.as_ref().map(Json))
        .bind(rec.updated_at)
        .bind(&rec.finished_output)
        .bind(rec.llm_context.as_ref().map(Json))
        .bind(rec.cancel_requested)
        .bind(rec.cancelled_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn delete(&self, task_id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM agent_tasks WHERE task_id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, filter: ListFilter) -> StoreResult<Vec<TaskRecord>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!("SELECT {COLUMNS} FROM agent_tasks"));
        if let Some(status) = filter.status {
            qb.push(" WHERE status = ").push_bind(status.as_str());
        }
        qb.push(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }
        if filter.offset > 0 {
            qb.push(" OFFSET ").push_bind(filter.offset as i64);
        }
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn count_active(&self) -> StoreResult<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM agent_tasks WHERE status IN ('pending', 'running')")
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as usize)
    }

    async fn cleanup(&self, older_than: Duration) -> StoreResult<usize> {
        let cutoff = Utc::now() - older_than;
        let result = sqlx::query(
            "DELETE FROM agent_tasks WHERE created_at < $1 AND status NOT IN ('pending', 'running')",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        let removed = result.rows_affected() as usize;
        info!(removed, "cleaned up old tasks");
        Ok(removed)
    }

    async fn request_cancel(&self, task_id: &str) -> StoreResult<CancelOutcome> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT status, cancel_requested FROM agent_tasks WHERE task_id = $1 FOR UPDATE")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        let status: TaskStatus = row.try_get::<String, _>("status")?.parse()?;
        let flagged: bool = row.try_get("cancel_requested")?;

        let outcome = match cancel_precheck(task_id, status, flagged)? {
            Some(CancelOutcome::AlreadyCancelled) => return Ok(CancelOutcome::AlreadyCancelled),
            Some(o) => o,
            None => {
                sqlx::query(
                    "UPDATE agent_tasks SET cancel_requested = TRUE, \
                     cancelled_at = COALESCE(cancelled_at, now()), updated_at = now() \
                     WHERE task_id = $1 AND status IN ('pending', 'running')",
                )
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
                CancelOutcome::Requested
            }
        };
        tx.commit().await?;

        if let Err(e) = sqlx::query("SELECT pg_notify($1, $2)")
            .bind(CANCEL_CHANNEL)
            .bind(task_id)
            .execute(&self.pool)
            .await
        {
            // the flag is set; pollers will still see it
            error!(task_id, error = %e, "failed to publish cancel notification");
        }
        info!(task_id, ?outcome, "cancellation requested");
        Ok(outcome)
    }

    async fn check_cancel_requested(&self, task_id: &str) -> StoreResult<bool> {
        let flag: Option<bool> = sqlx::query_scalar("SELECT cancel_requested FROM agent_tasks WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(flag.unwrap_or(false))
    }

    fn subscribe_cancel(&self, task_id: &str, callback: CancelCallback) -> Option<CancelSubscription> {
        self.listener_task
            .as_ref()
            .map(|_| self.listeners.register(task_id, callback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_steps_beyond_integer_column_is_rejected() {
        assert_eq!(steps_column("t", 50).unwrap(), 50);
        assert_eq!(steps_column("t", i32::MAX as u32).unwrap(), i32::MAX);
        assert!(matches!(steps_column("t", u32::MAX), Err(StoreError::Backend(_))));
    }
}
