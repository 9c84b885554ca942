// crates/cronhook/src/jobs/repo.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::jobs::model::{Job, JobRow, JobStatus, NewJob, Transition};
use crate::jobs::store::{DueQuery, JobStore, JobStoreError};

/// PostgreSQL-backed [`JobStore`].
#[derive(Clone)]
pub struct JobsRepo {
    pool: PgPool,
}

impl JobsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Returns: (pending, completed, failed)
    pub async fn counts(&self) -> anyhow::Result<(i64, i64, i64)> {
        let (pending, completed, failed): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending'),
                COUNT(*) FILTER (WHERE status = 'completed'),
                COUNT(*) FILTER (WHERE status = 'failed')
            FROM jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok((pending, completed, failed))
    }

    // Tells `NotFound` apart from `Stale`/`NotRetryable` after a guarded
    // write matched no row.
    async fn current_status(&self, id: Uuid) -> Result<Option<JobStatus>, JobStoreError> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(status.map(|s| s.parse::<JobStatus>()).transpose()?)
    }
}

fn into_jobs(rows: Vec<JobRow>) -> Result<Vec<Job>, JobStoreError> {
    rows.into_iter()
        .map(|row| Job::try_from(row).map_err(JobStoreError::from))
        .collect()
}

#[async_trait]
impl JobStore for JobsRepo {
    async fn insert(&self, job: NewJob) -> Result<Job, JobStoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO jobs (webhook_url, payload, scheduled_time, status, retries)
            VALUES ($1, $2, $3, 'pending', 0)
            RETURNING *
            "#,
        )
        .bind(&job.webhook_url)
        .bind(&job.payload)
        .bind(job.scheduled_time)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_into()?)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Job::try_from).transpose()?)
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>, JobStoreError> {
        let rows = match status {
            Some(st) => {
                sqlx::query_as::<_, JobRow>(
                    r#"
                    SELECT * FROM jobs
                    WHERE status = $1
                    ORDER BY scheduled_time ASC, created_at ASC
                    "#,
                )
                .bind(st.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, JobRow>(
                    r#"
                    SELECT * FROM jobs
                    ORDER BY scheduled_time ASC, created_at ASC
                    "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        into_jobs(rows)
    }

    /// Correctness: SELECT ... FOR UPDATE SKIP LOCKED, then stamp the lease in
    /// the same statement so two workers never claim the same row.
    async fn claim_due(&self, query: DueQuery<'_>) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            WITH due AS (
                SELECT id
                FROM jobs
                WHERE status = 'pending'
                  AND scheduled_time <= $1
                  AND (next_attempt_at IS NULL OR next_attempt_at <= $1)
                  AND (lock_expires_at IS NULL OR lock_expires_at < $1 OR locked_by = $2)
                  AND NOT (id = ANY($5))
                ORDER BY scheduled_time ASC, created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $4
            )
            UPDATE jobs j
            SET locked_by = $2,
                lock_expires_at = $3,
                updated_at = now()
            FROM due
            WHERE j.id = due.id
            RETURNING j.*
            "#,
        )
        .bind(query.now)
        .bind(query.worker_id)
        .bind(query.lease_until)
        .bind(query.limit)
        .bind(query.exclude)
        .fetch_all(&self.pool)
        .await?;

        // RETURNING does not preserve the CTE ordering.
        let mut jobs = into_jobs(rows)?;
        jobs.sort_by(|a, b| {
            a.scheduled_time
                .cmp(&b.scheduled_time)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(jobs)
    }

    async fn apply_transition(
        &self,
        id: Uuid,
        worker_id: &str,
        expected_retries: i32,
        transition: &Transition,
    ) -> Result<Job, JobStoreError> {
        let row = match transition {
            Transition::Complete { at } => {
                sqlx::query_as::<_, JobRow>(
                    r#"
                    UPDATE jobs
                    SET status = 'completed',
                        last_error = NULL,
                        completed_at = $4,
                        next_attempt_at = NULL,
                        locked_by = NULL,
                        lock_expires_at = NULL,
                        updated_at = now()
                    WHERE id = $1
                      AND status = 'pending'
                      AND retries = $3
                      AND (locked_by IS NULL OR locked_by = $2)
                    RETURNING *
                    "#,
                )
                .bind(id)
                .bind(worker_id)
                .bind(expected_retries)
                .bind(*at)
                .fetch_optional(&self.pool)
                .await?
            }
            Transition::Retry {
                retries,
                last_error,
                next_attempt_at,
            } => {
                sqlx::query_as::<_, JobRow>(
                    r#"
                    UPDATE jobs
                    SET retries = $4,
                        last_error = $5,
                        next_attempt_at = $6,
                        locked_by = NULL,
                        lock_expires_at = NULL,
                        updated_at = now()
                    WHERE id = $1
                      AND status = 'pending'
                      AND retries = $3
                      AND (locked_by IS NULL OR locked_by = $2)
                    RETURNING *
                    "#,
                )
                .bind(id)
                .bind(worker_id)
                .bind(expected_retries)
                .bind(*retries)
                .bind(last_error)
                .bind(*next_attempt_at)
                .fetch_optional(&self.pool)
                .await?
            }
            Transition::Fail {
                retries,
                last_error,
                at,
            } => {
                sqlx::query_as::<_, JobRow>(
                    r#"
                    UPDATE jobs
                    SET status = 'failed',
                        retries = $4,
                        last_error = $5,
                        completed_at = $6,
                        next_attempt_at = NULL,
                        locked_by = NULL,
                        lock_expires_at = NULL,
                        updated_at = now()
                    WHERE id = $1
                      AND status = 'pending'
                      AND retries = $3
                      AND (locked_by IS NULL OR locked_by = $2)
                    RETURNING *
                    "#,
                )
                .bind(id)
                .bind(worker_id)
                .bind(expected_retries)
                .bind(*retries)
                .bind(last_error)
                .bind(*at)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        match row {
            Some(row) => Ok(row.try_into()?),
            None => match self.current_status(id).await? {
                None => Err(JobStoreError::NotFound(id)),
                Some(_) => Err(JobStoreError::Stale {
                    id,
                    expected_retries,
                }),
            },
        }
    }

    async fn renew_lease(
        &self,
        id: Uuid,
        worker_id: &str,
        expected_retries: i32,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET locked_by = $2,
                lock_expires_at = $5,
                updated_at = now()
            WHERE id = $1
              AND status = 'pending'
              AND retries = $3
              AND (locked_by = $2 OR lock_expires_at IS NULL OR lock_expires_at < $4)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(expected_retries)
        .bind(now)
        .bind(lease_until)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.try_into()?),
            None => match self.current_status(id).await? {
                None => Err(JobStoreError::NotFound(id)),
                Some(_) => Err(JobStoreError::Stale {
                    id,
                    expected_retries,
                }),
            },
        }
    }

    async fn reset_for_retry(&self, id: Uuid) -> Result<Job, JobStoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET status = 'pending',
                retries = 0,
                last_error = NULL,
                completed_at = NULL,
                next_attempt_at = NULL,
                locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = now()
            WHERE id = $1
              AND status = 'failed'
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.try_into()?),
            None => match self.current_status(id).await? {
                None => Err(JobStoreError::NotFound(id)),
                Some(status) => Err(JobStoreError::NotRetryable { id, status }),
            },
        }
    }

    async fn delete(&self, id: Uuid) -> Result<Job, JobStoreError> {
        let row = sqlx::query_as::<_, JobRow>("DELETE FROM jobs WHERE id = $1 RETURNING *")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(row.try_into()?),
            None => Err(JobStoreError::NotFound(id)),
        }
    }
}
