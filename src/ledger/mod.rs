/// Execution ledger
///
/// Durable per-task run history. Every scheduled, startup or manual run
/// marks itself started before the body executes and successful after it
/// returns cleanly, so a crash mid-run reads back as "ran, not successful"
/// and the next process start can decide whether today's run still owes.

use crate::error::Result;
use crate::storage::retry::RetryPolicy;
use chrono::{DateTime, Local, Utc};
use sqlx::sqlite::SqlitePool;

/// Persisted run bookkeeping for one task
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TaskExecutionRecord {
    pub task_name: String,
    pub last_run: DateTime<Utc>,
    pub last_successful_run: Option<DateTime<Utc>>,
    pub success: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Which upsert to apply
#[derive(Debug, Clone, Copy)]
enum RunMark {
    Started,
    Succeeded,
}

/// SQLite-backed execution ledger
#[derive(Debug, Clone)]
pub struct ExecutionLedger {
    pool: SqlitePool,
    retry: RetryPolicy,
}

impl ExecutionLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_retry(pool, RetryPolicy::default())
    }

    pub fn with_retry(pool: SqlitePool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    /// Record that a run is starting: `last_run = now`, `success = false`.
    pub async fn update_last_run(&self, task_name: &str) -> Result<()> {
        self.upsert(task_name, RunMark::Started, Utc::now()).await
    }

    /// Record a clean finish: `last_run = last_successful_run = now`, `success = true`.
    pub async fn update_last_successful_run(&self, task_name: &str) -> Result<()> {
        self.upsert(task_name, RunMark::Succeeded, Utc::now()).await
    }

    /// Whether the task still owes a successful run today (local calendar).
    pub async fn should_run_today(&self, task_name: &str) -> Result<bool> {
        self.should_run_on(task_name, Local::now()).await
    }

    /// Same as [`should_run_today`](Self::should_run_today) against an explicit local instant.
    pub async fn should_run_on(&self, task_name: &str, now: DateTime<Local>) -> Result<bool> {
        let Some(last_success) = self.last_successful_run(task_name).await? else {
            return Ok(true);
        };
        let last_date = last_success.with_timezone(&Local).date_naive();
        Ok(last_date < now.date_naive())
    }

    pub async fn get(&self, task_name: &str) -> Result<Option<TaskExecutionRecord>> {
        self.retry
            .run(|| {
                sqlx::query_as::<_, TaskExecutionRecord>(
                    "SELECT task_name, last_run, last_successful_run, success, created_at, \
                     updated_at FROM task_executions WHERE task_name = ?",
                )
                .bind(task_name)
                .fetch_optional(&self.pool)
            })
            .await
    }

    /// All rows, most recently started first
    pub async fn list(&self) -> Result<Vec<TaskExecutionRecord>> {
        self.retry
            .run(|| {
                sqlx::query_as::<_, TaskExecutionRecord>(
                    "SELECT task_name, last_run, last_successful_run, success, created_at, \
                     updated_at FROM task_executions ORDER BY last_run DESC",
                )
                .fetch_all(&self.pool)
            })
            .await
    }

    pub async fn last_run(&self, task_name: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.get(task_name).await?.map(|r| r.last_run))
    }

    pub async fn last_successful_run(&self, task_name: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.get(task_name).await?.and_then(|r| r.last_successful_run))
    }

    /// Read-decide-write inside one transaction, retried as a whole on contention.
    async fn upsert(&self, task_name: &str, mark: RunMark, now: DateTime<Utc>) -> Result<()> {
        self.retry
            .run(|| upsert_once(&self.pool, task_name, mark, now))
            .await
    }
}

async fn upsert_once(
    pool: &SqlitePool,
    task_name: &str,
    mark: RunMark,
    now: DateTime<Utc>,
) -> std::result::Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    let existing: Option<(String,)> =
        sqlx::query_as("SELECT task_name FROM task_executions WHERE task_name = ?")
            .bind(task_name)
            .fetch_optional(&mut *tx)
            .await?;

    match (existing, mark) {
        (None, RunMark::Started) => {
            sqlx::query(
                "INSERT INTO task_executions \
                 (task_name, last_run, last_successful_run, success, created_at, updated_at) \
                 VALUES (?, ?, NULL, 0, ?, ?)",
            )
            .bind(task_name)
            .bind(now)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        (None, RunMark::Succeeded) => {
            sqlx::query(
                "INSERT INTO task_executions \
                 (task_name, last_run, last_successful_run, success, created_at, updated_at) \
                 VALUES (?, ?, ?, 1, ?, ?)",
            )
            .bind(task_name)
            .bind(now)
            .bind(now)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        (Some(_), RunMark::Started) => {
            sqlx::query(
                "UPDATE task_executions SET last_run = ?, success = 0, updated_at = ? \
                 WHERE task_name = ?",
            )
            .bind(now)
            .bind(now)
            .bind(task_name)
            .execute(&mut *tx)
            .await?;
        }
        (Some(_), RunMark::Succeeded) => {
            sqlx::query(
                "UPDATE task_executions SET last_run = ?, last_successful_run = ?, success = 1, \
                 updated_at = ? WHERE task_name = ?",
            )
            .bind(now)
            .bind(now)
            .bind(now)
            .bind(task_name)
            .execute(&mut *tx)
            .await?;
        }
    }

    tx.commit().await
}
