//! Job store abstraction shared by the dispatcher and the management API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::model::{Job, JobStatus, NewJob, Transition, UnknownStatus};

#[derive(Debug, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(Uuid),

    /// The row no longer matches what the caller observed (deleted, reset or
    /// claimed by someone else in between).
    #[error("job {id} changed concurrently (expected pending with retries={expected_retries})")]
    Stale { id: Uuid, expected_retries: i32 },

    #[error("job {id} is {status}; only failed jobs can be retried")]
    NotRetryable { id: Uuid, status: JobStatus },

    #[error("invalid job record: {0}")]
    InvalidRecord(#[from] UnknownStatus),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("storage error: {0}")]
    Unavailable(String),
}

/// Parameters for one due-job claim.
#[derive(Debug, Clone)]
pub struct DueQuery<'a> {
    pub now: DateTime<Utc>,
    pub worker_id: &'a str,
    /// Lease deadline stamped on every claimed job.
    pub lease_until: DateTime<Utc>,
    pub limit: i64,
    /// Jobs already handled earlier in the same sweep.
    pub exclude: &'a [Uuid],
}

/// Transactional record store holding jobs.
///
/// Implementations must make every method atomic per job.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: NewJob) -> Result<Job, JobStoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>, JobStoreError>;

    /// All jobs, optionally filtered by status, ordered by `scheduled_time` ascending.
    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>, JobStoreError>;

    /// Due jobs ordered by `scheduled_time` ascending, leased to `worker_id`.
    ///
    /// A job is returned only if it is pending, `scheduled_time <= now`,
    /// its backoff (if any) has elapsed, and no other unexpired lease holds it.
    async fn claim_due(&self, query: DueQuery<'_>) -> Result<Vec<Job>, JobStoreError>;

    /// Conditionally writes a worker transition.
    ///
    /// Succeeds only while the job is still pending with `expected_retries`
    /// and not leased to a different worker; otherwise returns
    /// [`JobStoreError::Stale`] (or `NotFound` if the row is gone).
    async fn apply_transition(
        &self,
        id: Uuid,
        worker_id: &str,
        expected_retries: i32,
        transition: &Transition,
    ) -> Result<Job, JobStoreError>;

    /// Re-stamps the lease on a claimed job right before it is delivered.
    ///
    /// Succeeds while the job is pending with `expected_retries` and is either
    /// leased to `worker_id` or not under any unexpired lease at `now`.
    /// Otherwise returns [`JobStoreError::Stale`] (or `NotFound`) and the
    /// caller must not deliver.
    async fn renew_lease(
        &self,
        id: Uuid,
        worker_id: &str,
        expected_retries: i32,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Job, JobStoreError>;

    /// Manual reset of a failed job back to pending with zero retries.
    async fn reset_for_retry(&self, id: Uuid) -> Result<Job, JobStoreError>;

    async fn delete(&self, id: Uuid) -> Result<Job, JobStoreError>;
}
