//! In-memory job store for tests and local runs without PostgreSQL.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::model::{Job, JobStatus, NewJob, Transition};
use super::store::{DueQuery, JobStore, JobStoreError};

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Overwrites a stored job verbatim. Intended for fixtures.
    pub async fn put(&self, job: Job) {
        self.jobs.lock().await.insert(job.id, job);
    }
}

fn sort_by_schedule(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| {
        a.scheduled_time
            .cmp(&b.scheduled_time)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: NewJob) -> Result<Job, JobStoreError> {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            webhook_url: job.webhook_url,
            payload: job.payload,
            scheduled_time: job.scheduled_time,
            status: JobStatus::Pending,
            retries: 0,
            last_error: None,
            created_at: now,
            completed_at: None,
            next_attempt_at: None,
            locked_by: None,
            lock_expires_at: None,
            updated_at: now,
        };
        self.jobs.lock().await.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.lock().await;
        let mut out: Vec<Job> = jobs
            .values()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        sort_by_schedule(&mut out);
        Ok(out)
    }

    async fn claim_due(&self, query: DueQuery<'_>) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs = self.jobs.lock().await;
        let now = query.now;

        let mut due: Vec<Job> = jobs
            .values()
            .filter(|j| {
                j.is_due(now)
                    && !query.exclude.contains(&j.id)
                    && (!j.is_leased(now) || j.locked_by.as_deref() == Some(query.worker_id))
            })
            .cloned()
            .collect();
        sort_by_schedule(&mut due);
        due.truncate(query.limit.max(0) as usize);

        for job in due.iter_mut() {
            job.locked_by = Some(query.worker_id.to_string());
            job.lock_expires_at = Some(query.lease_until);
            job.updated_at = Utc::now();
            jobs.insert(job.id, job.clone());
        }

        Ok(due)
    }

    async fn apply_transition(
        &self,
        id: Uuid,
        worker_id: &str,
        expected_retries: i32,
        transition: &Transition,
    ) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;

        let lease_ok = job
            .locked_by
            .as_deref()
            .map_or(true, |owner| owner == worker_id);
        if job.status != JobStatus::Pending || job.retries != expected_retries || !lease_ok {
            return Err(JobStoreError::Stale {
                id,
                expected_retries,
            });
        }

        transition.apply_to(job, Utc::now());
        Ok(job.clone())
    }

    async fn renew_lease(
        &self,
        id: Uuid,
        worker_id: &str,
        expected_retries: i32,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;

        let ours = job.locked_by.as_deref() == Some(worker_id);
        if job.status != JobStatus::Pending
            || job.retries != expected_retries
            || !(ours || !job.is_leased(now))
        {
            return Err(JobStoreError::Stale {
                id,
                expected_retries,
            });
        }

        job.locked_by = Some(worker_id.to_string());
        job.lock_expires_at = Some(lease_until);
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn reset_for_retry(&self, id: Uuid) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;

        if job.status != JobStatus::Failed {
            return Err(JobStoreError::NotRetryable {
                id,
                status: job.status,
            });
        }

        job.status = JobStatus::Pending;
        job.retries = 0;
        job.last_error = None;
        job.completed_at = None;
        job.next_attempt_at = None;
        job.locked_by = None;
        job.lock_expires_at = None;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn delete(&self, id: Uuid) -> Result<Job, JobStoreError> {
        self.jobs
            .lock()
            .await
            .remove(&id)
            .ok_or(JobStoreError::NotFound(id))
    }
}
