//! PostgreSQL implementation of the job store.
//!
//! Jobs, recurring registrations and scheduler leases live in three tables
//! shared by every process. Dequeue claims rows with `FOR UPDATE SKIP LOCKED`
//! so concurrent workers in different processes never take the same job, and
//! the lease is a single conditional upsert per tick, timed by the database
//! clock so that skew between hosts cannot hand it to two schedulers.

use super::{JobStore, STALLED_MESSAGE, StalledJobs, UpsertOutcome, child_failed_message};
use crate::{
    CadenceError, Result,
    config::StoreConfig,
    job::{Job, JobId, JobStatus, RecurringJob},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row, postgres::{PgExecutor, PgPoolOptions}};
use std::{collections::HashMap, time::Duration};
use tracing::{debug, info};

const JOB_COLUMNS: &str = "id, queue_name, name, payload, status, attempts, max_attempts, backoff, \
     dedup_key, recurring_key, created_at, scheduled_at, started_at, locked_until, finished_at, \
     error_message, result, parent_id, pending_children";

const RECURRING_COLUMNS: &str = "key, queue_name, name, payload, cron, timezone, max_attempts, backoff, \
     children, next_run_at, created_at, updated_at";

fn to_i32(value: u32, field: &str) -> Result<i32> {
    i32::try_from(value).map_err(|_| CadenceError::Queue {
        message: format!("{} out of range for storage: {}", field, value),
    })
}

#[derive(FromRow, Clone)]
pub(crate) struct JobRow {
    pub id: uuid::Uuid,
    pub queue_name: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub backoff: serde_json::Value,
    pub dedup_key: Option<String>,
    pub recurring_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub parent_id: Option<uuid::Uuid>,
    pub pending_children: i32,
}

impl JobRow {
    pub fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: self.id,
            queue_name: self.queue_name,
            name: self.name,
            payload: self.payload,
            status: self.status.parse::<JobStatus>()?,
            attempts: u32::try_from(self.attempts).unwrap_or(0),
            max_attempts: u32::try_from(self.max_attempts).unwrap_or(1).max(1),
            backoff: serde_json::from_value(self.backoff)?,
            dedup_key: self.dedup_key,
            recurring_key: self.recurring_key,
            created_at: self.created_at,
            scheduled_at: self.scheduled_at,
            started_at: self.started_at,
            locked_until: self.locked_until,
            finished_at: self.finished_at,
            error_message: self.error_message,
            result: self.result,
            parent_id: self.parent_id,
            pending_children: u32::try_from(self.pending_children).unwrap_or(0),
        })
    }
}

#[derive(FromRow, Clone)]
pub(crate) struct RecurringRow {
    pub key: String,
    pub queue_name: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub cron: String,
    pub timezone: String,
    pub max_attempts: i32,
    pub backoff: serde_json::Value,
    pub children: serde_json::Value,
    pub next_run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecurringRow {
    pub fn into_recurring(self) -> Result<RecurringJob> {
        Ok(RecurringJob {
            key: self.key,
            queue_name: self.queue_name,
            name: self.name,
            payload: self.payload,
            cron: self.cron,
            timezone: self.timezone,
            max_attempts: u32::try_from(self.max_attempts).unwrap_or(1).max(1),
            backoff: serde_json::from_value(self.backoff)?,
            children: serde_json::from_value(self.children)?,
            next_run_at: self.next_run_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Job store on a shared PostgreSQL database.
#[derive(Clone, Debug)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool from the store section of the configuration and create
    /// the tables when asked to.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(config.connection_timeout)
            .connect(&config.url)
            .await?;

        let store = Self::new(pool);
        if config.create_tables {
            store.create_tables().await?;
        }
        info!(pool_size = config.pool_size, "Connected to PostgreSQL job store");
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist yet.
    pub async fn create_tables(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS cadence_jobs (
                id UUID PRIMARY KEY,
                seq BIGSERIAL NOT NULL,
                queue_name VARCHAR NOT NULL,
                name VARCHAR NOT NULL,
                payload JSONB NOT NULL,
                status VARCHAR NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 1,
                backoff JSONB NOT NULL,
                dedup_key VARCHAR,
                recurring_key VARCHAR,
                created_at TIMESTAMPTZ NOT NULL,
                scheduled_at TIMESTAMPTZ NOT NULL,
                started_at TIMESTAMPTZ,
                locked_until TIMESTAMPTZ,
                finished_at TIMESTAMPTZ,
                error_message TEXT,
                result JSONB,
                parent_id UUID,
                pending_children INTEGER NOT NULL DEFAULT 0
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_cadence_jobs_dequeue
                ON cadence_jobs (queue_name, status, scheduled_at, seq)
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_cadence_jobs_dedup
                ON cadence_jobs (queue_name, dedup_key) WHERE dedup_key IS NOT NULL
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_cadence_jobs_stalled
                ON cadence_jobs (queue_name, locked_until) WHERE status = 'active'
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_cadence_jobs_parent
                ON cadence_jobs (parent_id) WHERE parent_id IS NOT NULL
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS cadence_recurring_jobs (
                key VARCHAR PRIMARY KEY,
                queue_name VARCHAR NOT NULL,
                name VARCHAR NOT NULL,
                payload JSONB NOT NULL,
                cron VARCHAR NOT NULL,
                timezone VARCHAR NOT NULL,
                max_attempts INTEGER NOT NULL DEFAULT 1,
                backoff JSONB NOT NULL,
                children JSONB NOT NULL DEFAULT '[]',
                next_run_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_cadence_recurring_due
                ON cadence_recurring_jobs (queue_name, next_run_at)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS cadence_scheduler_leases (
                queue_name VARCHAR PRIMARY KEY,
                holder VARCHAR NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Job store tables ready");
        Ok(())
    }

    fn job_not_found(job_id: JobId) -> CadenceError {
        CadenceError::JobNotFound {
            id: job_id.to_string(),
        }
    }

    /// Insert unless the dedup key is taken; `None` on conflict.
    async fn insert_job<'e>(executor: impl PgExecutor<'e>, job: &Job) -> Result<Option<JobId>> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO cadence_jobs (
                id, queue_name, name, payload, status, attempts, max_attempts, backoff,
                dedup_key, recurring_key, created_at, scheduled_at, parent_id, pending_children
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (queue_name, dedup_key) WHERE dedup_key IS NOT NULL DO NOTHING
            RETURNING id
            "#,
        )
        .bind(job.id)
        .bind(&job.queue_name)
        .bind(&job.name)
        .bind(&job.payload)
        .bind(job.status.as_str())
        .bind(to_i32(job.attempts, "attempts")?)
        .bind(to_i32(job.max_attempts, "max_attempts")?)
        .bind(serde_json::to_value(&job.backoff)?)
        .bind(&job.dedup_key)
        .bind(&job.recurring_key)
        .bind(job.created_at)
        .bind(job.scheduled_at)
        .bind(job.parent_id)
        .bind(to_i32(job.pending_children, "pending_children")?)
        .fetch_optional(executor)
        .await?;

        Ok(inserted.map(|row| row.get("id")))
    }

    async fn existing_by_dedup_key<'e>(executor: impl PgExecutor<'e>, job: &Job) -> Result<JobId> {
        let existing: uuid::Uuid = sqlx::query_scalar(
            "SELECT id FROM cadence_jobs WHERE queue_name = $1 AND dedup_key = $2",
        )
        .bind(&job.queue_name)
        .bind(&job.dedup_key)
        .fetch_one(executor)
        .await?;
        Ok(existing)
    }

    /// Fail a parent still waiting on the child that just failed for good.
    async fn fail_parent<'e>(
        executor: impl PgExecutor<'e>,
        parent_id: JobId,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE cadence_jobs SET status = $1, finished_at = $2, error_message = $3 WHERE id = $4 AND status = $5",
        )
        .bind(JobStatus::Failed.as_str())
        .bind(now)
        .bind(message)
        .bind(parent_id)
        .bind(JobStatus::WaitingChildren.as_str())
        .execute(executor)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn enqueue(&self, job: Job) -> Result<JobId> {
        if let Some(id) = Self::insert_job(&self.pool, &job).await? {
            return Ok(id);
        }
        // Conflict on the dedup key: hand back the job that already holds it
        Self::existing_by_dedup_key(&self.pool, &job).await
    }

    async fn enqueue_flow(&self, parent: Job, children: Vec<Job>) -> Result<JobId> {
        let mut tx = self.pool.begin().await?;

        let Some(id) = Self::insert_job(&mut *tx, &parent).await? else {
            let existing = Self::existing_by_dedup_key(&mut *tx, &parent).await?;
            tx.rollback().await?;
            return Ok(existing);
        };
        for child in &children {
            Self::insert_job(&mut *tx, child).await?;
        }

        tx.commit().await?;
        Ok(id)
    }

    async fn dequeue(&self, queue_name: &str, lock_for: Duration) -> Result<Option<Job>> {
        let now = self.now();
        let locked_until = chrono::Duration::from_std(lock_for)
            .ok()
            .and_then(|lock_for| now.checked_add_signed(lock_for))
            .ok_or_else(|| CadenceError::Queue {
                message: format!("Invalid job lock duration: {:?}", lock_for),
            })?;

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE cadence_jobs
            SET status = $1, started_at = $2, locked_until = $5, attempts = attempts + 1
            WHERE id = (
                SELECT id FROM cadence_jobs
                WHERE queue_name = $3 AND status = $4 AND scheduled_at <= $2
                ORDER BY scheduled_at ASC, seq ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(JobStatus::Active.as_str())
        .bind(now)
        .bind(queue_name)
        .bind(JobStatus::Ready.as_str())
        .bind(locked_until)
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobRow::into_job).transpose()
    }

    async fn extend_lock(&self, job_id: JobId, until: DateTime<Utc>) -> Result<bool> {
        let updated = sqlx::query("UPDATE cadence_jobs SET locked_until = $2 WHERE id = $1 AND status = $3")
            .bind(job_id)
            .bind(until)
            .bind(JobStatus::Active.as_str())
            .execute(&self.pool)
            .await?;
        Ok(updated.rows_affected() == 1)
    }

    async fn recover_stalled(&self, queue_name: &str, now: DateTime<Utc>) -> Result<StalledJobs> {
        let mut tx = self.pool.begin().await?;

        let requeued = sqlx::query(
            r#"
            UPDATE cadence_jobs
            SET status = $1, scheduled_at = $2, locked_until = NULL, error_message = $3
            WHERE queue_name = $4 AND status = $5 AND locked_until <= $2 AND attempts < max_attempts
            "#,
        )
        .bind(JobStatus::Ready.as_str())
        .bind(now)
        .bind(STALLED_MESSAGE)
        .bind(queue_name)
        .bind(JobStatus::Active.as_str())
        .execute(&mut *tx)
        .await?;

        let failed = sqlx::query(
            r#"
            UPDATE cadence_jobs
            SET status = $1, finished_at = $2, locked_until = NULL, error_message = $3
            WHERE queue_name = $4 AND status = $5 AND locked_until <= $2
            RETURNING id, name, parent_id
            "#,
        )
        .bind(JobStatus::Failed.as_str())
        .bind(now)
        .bind(STALLED_MESSAGE)
        .bind(queue_name)
        .bind(JobStatus::Active.as_str())
        .fetch_all(&mut *tx)
        .await?;

        for row in &failed {
            if let Some(parent_id) = row.get::<Option<uuid::Uuid>, _>("parent_id") {
                let name: String = row.get("name");
                let message = child_failed_message(row.get("id"), &name, STALLED_MESSAGE);
                Self::fail_parent(&mut *tx, parent_id, &message, now).await?;
            }
        }

        tx.commit().await?;
        Ok(StalledJobs {
            requeued: requeued.rows_affected(),
            failed: failed.len() as u64,
        })
    }

    async fn complete_job(&self, job_id: JobId, result: Option<serde_json::Value>) -> Result<()> {
        let now = self.now();
        let mut tx = self.pool.begin().await?;

        let parent_id: Option<Option<uuid::Uuid>> = sqlx::query_scalar(
            r#"
            UPDATE cadence_jobs SET status = $1, finished_at = $2, locked_until = NULL, result = $3
            WHERE id = $4
            RETURNING parent_id
            "#,
        )
        .bind(JobStatus::Completed.as_str())
        .bind(now)
        .bind(result)
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(parent_id) = parent_id else {
            return Err(Self::job_not_found(job_id));
        };

        if let Some(parent_id) = parent_id {
            // The last pending child releases the parent
            sqlx::query(
                r#"
                UPDATE cadence_jobs
                SET pending_children = GREATEST(pending_children - 1, 0),
                    status = CASE WHEN pending_children <= 1 THEN $2 ELSE status END,
                    scheduled_at = CASE WHEN pending_children <= 1 THEN $3 ELSE scheduled_at END
                WHERE id = $1 AND status = $4
                "#,
            )
            .bind(parent_id)
            .bind(JobStatus::Ready.as_str())
            .bind(now)
            .bind(JobStatus::WaitingChildren.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn fail_job(
        &self,
        job_id: JobId,
        error_message: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let Some(retry_at) = retry_at else {
            let now = self.now();
            let mut tx = self.pool.begin().await?;

            let failed = sqlx::query(
                r#"
                UPDATE cadence_jobs SET status = $1, finished_at = $2, locked_until = NULL, error_message = $3
                WHERE id = $4
                RETURNING name, parent_id
                "#,
            )
            .bind(JobStatus::Failed.as_str())
            .bind(now)
            .bind(error_message)
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Self::job_not_found(job_id))?;

            if let Some(parent_id) = failed.get::<Option<uuid::Uuid>, _>("parent_id") {
                let name: String = failed.get("name");
                let message = child_failed_message(job_id, &name, error_message);
                Self::fail_parent(&mut *tx, parent_id, &message, now).await?;
            }

            tx.commit().await?;
            return Ok(());
        };

        let updated = sqlx::query(
            r#"
            UPDATE cadence_jobs SET status = $1, scheduled_at = $2, locked_until = NULL, error_message = $3
            WHERE id = $4
            "#,
        )
        .bind(JobStatus::Delayed.as_str())
        .bind(retry_at)
        .bind(error_message)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(Self::job_not_found(job_id));
        }
        Ok(())
    }

    async fn promote_due_jobs(&self, queue_name: &str, now: DateTime<Utc>) -> Result<u64> {
        let promoted = sqlx::query(
            "UPDATE cadence_jobs SET status = $1 WHERE queue_name = $2 AND status = $3 AND scheduled_at <= $4",
        )
        .bind(JobStatus::Ready.as_str())
        .bind(queue_name)
        .bind(JobStatus::Delayed.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(promoted.rows_affected())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM cadence_jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobRow::into_job).transpose()
    }

    async fn list_children(&self, parent_id: JobId) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM cadence_jobs WHERE parent_id = $1 ORDER BY seq ASC"
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn upsert_recurring(&self, recurring: RecurringJob) -> Result<UpsertOutcome> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, RecurringRow>(&format!(
            "SELECT {RECURRING_COLUMNS} FROM cadence_recurring_jobs WHERE key = $1 FOR UPDATE"
        ))
        .bind(&recurring.key)
        .fetch_optional(&mut *tx)
        .await?
        .map(RecurringRow::into_recurring)
        .transpose()?;

        let outcome = match existing {
            Some(existing) if existing.same_definition(&recurring) => UpsertOutcome::Unchanged,
            Some(_) => {
                sqlx::query(
                    r#"
                    UPDATE cadence_recurring_jobs
                    SET queue_name = $2, name = $3, payload = $4, cron = $5, timezone = $6,
                        max_attempts = $7, backoff = $8, children = $9, next_run_at = $10,
                        updated_at = $11
                    WHERE key = $1
                    "#,
                )
                .bind(&recurring.key)
                .bind(&recurring.queue_name)
                .bind(&recurring.name)
                .bind(&recurring.payload)
                .bind(&recurring.cron)
                .bind(&recurring.timezone)
                .bind(to_i32(recurring.max_attempts, "max_attempts")?)
                .bind(serde_json::to_value(&recurring.backoff)?)
                .bind(serde_json::to_value(&recurring.children)?)
                .bind(recurring.next_run_at)
                .bind(recurring.updated_at)
                .execute(&mut *tx)
                .await?;
                UpsertOutcome::Updated
            }
            None => {
                // A concurrent first registration of the same key counts as unchanged
                let inserted = sqlx::query(
                    r#"
                    INSERT INTO cadence_recurring_jobs (
                        key, queue_name, name, payload, cron, timezone, max_attempts, backoff,
                        children, next_run_at, created_at, updated_at
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                    ON CONFLICT (key) DO NOTHING
                    "#,
                )
                .bind(&recurring.key)
                .bind(&recurring.queue_name)
                .bind(&recurring.name)
                .bind(&recurring.payload)
                .bind(&recurring.cron)
                .bind(&recurring.timezone)
                .bind(to_i32(recurring.max_attempts, "max_attempts")?)
                .bind(serde_json::to_value(&recurring.backoff)?)
                .bind(serde_json::to_value(&recurring.children)?)
                .bind(recurring.next_run_at)
                .bind(recurring.created_at)
                .bind(recurring.updated_at)
                .execute(&mut *tx)
                .await?;

                if inserted.rows_affected() == 0 {
                    UpsertOutcome::Unchanged
                } else {
                    UpsertOutcome::Created
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn due_recurring(
        &self,
        queue_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecurringJob>> {
        let rows = sqlx::query_as::<_, RecurringRow>(&format!(
            r#"
            SELECT {RECURRING_COLUMNS} FROM cadence_recurring_jobs
            WHERE queue_name = $1 AND next_run_at <= $2
            ORDER BY next_run_at ASC, key ASC
            "#
        ))
        .bind(queue_name)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RecurringRow::into_recurring).collect()
    }

    async fn advance_recurring(
        &self,
        key: &str,
        expected_next: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE cadence_recurring_jobs
            SET next_run_at = $3, updated_at = $4
            WHERE key = $1 AND next_run_at = $2
            "#,
        )
        .bind(key)
        .bind(expected_next)
        .bind(next)
        .bind(self.now())
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    async fn list_recurring(&self, queue_name: &str) -> Result<Vec<RecurringJob>> {
        let rows = sqlx::query_as::<_, RecurringRow>(&format!(
            "SELECT {RECURRING_COLUMNS} FROM cadence_recurring_jobs WHERE queue_name = $1 ORDER BY key"
        ))
        .bind(queue_name)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RecurringRow::into_recurring).collect()
    }

    async fn remove_recurring(&self, key: &str) -> Result<bool> {
        let removed = sqlx::query("DELETE FROM cadence_recurring_jobs WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(removed.rows_affected() > 0)
    }

    async fn list_ready_and_delayed(&self, queue_name: &str) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM cadence_jobs
            WHERE queue_name = $1 AND status IN ($2, $3)
            ORDER BY scheduled_at ASC, seq ASC
            "#
        ))
        .bind(queue_name)
        .bind(JobStatus::Ready.as_str())
        .bind(JobStatus::Delayed.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn purge_queue(&self, queue_name: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let jobs =
            sqlx::query("DELETE FROM cadence_jobs WHERE queue_name = $1 AND status IN ($2, $3, $4)")
                .bind(queue_name)
                .bind(JobStatus::Ready.as_str())
                .bind(JobStatus::Delayed.as_str())
                .bind(JobStatus::WaitingChildren.as_str())
                .execute(&mut *tx)
                .await?;
        let recurring = sqlx::query("DELETE FROM cadence_recurring_jobs WHERE queue_name = $1")
            .bind(queue_name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(jobs.rows_affected() + recurring.rows_affected())
    }

    async fn job_counts(&self, queue_name: &str) -> Result<HashMap<JobStatus, u64>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM cadence_jobs WHERE queue_name = $1 GROUP BY status",
        )
        .bind(queue_name)
        .fetch_all(&self.pool)
        .await?;

        let mut counts: HashMap<JobStatus, u64> =
            JobStatus::ALL.into_iter().map(|status| (status, 0)).collect();
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            counts.insert(status.parse()?, count.max(0) as u64);
        }
        Ok(counts)
    }

    async fn try_acquire_lease(
        &self,
        queue_name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let acquired = sqlx::query(
            r#"
            INSERT INTO cadence_scheduler_leases (queue_name, holder, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (queue_name) DO UPDATE
            SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
            WHERE cadence_scheduler_leases.holder = EXCLUDED.holder
               OR cadence_scheduler_leases.expires_at <= NOW()
            RETURNING holder
            "#,
        )
        .bind(queue_name)
        .bind(holder)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(acquired.is_some())
    }

    async fn release_lease(&self, queue_name: &str, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM cadence_scheduler_leases WHERE queue_name = $1 AND holder = $2")
            .bind(queue_name)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
