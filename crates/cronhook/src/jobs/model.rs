use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle state of a scheduled delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job status `{0}` (expected pending, completed or failed)")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// One scheduled webhook delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub webhook_url: String,
    pub payload: Value,
    pub scheduled_time: DateTime<Utc>,
    pub status: JobStatus,
    pub retries: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Set only when retry backoff is enabled.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Eligible for a delivery attempt at `now`, ignoring leases.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending
            && self.scheduled_time <= now
            && self.next_attempt_at.map_or(true, |t| t <= now)
    }

    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.locked_by.is_some() && self.lock_expires_at.is_some_and(|t| t >= now)
    }
}

/// Fields supplied by the registration layer.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub webhook_url: String,
    pub payload: Value,
    pub scheduled_time: DateTime<Utc>,
}

/// Raw `jobs` row; `status` is validated when converting into [`Job`].
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub webhook_url: String,
    pub payload: Value,
    pub scheduled_time: DateTime<Utc>,
    pub status: String,
    pub retries: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = UnknownStatus;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            webhook_url: row.webhook_url,
            payload: row.payload,
            scheduled_time: row.scheduled_time,
            status: row.status.parse()?,
            retries: row.retries,
            last_error: row.last_error,
            created_at: row.created_at,
            completed_at: row.completed_at,
            next_attempt_at: row.next_attempt_at,
            locked_by: row.locked_by,
            lock_expires_at: row.lock_expires_at,
            updated_at: row.updated_at,
        })
    }
}

/// State change computed by the dispatcher after one delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// pending -> completed
    Complete { at: DateTime<Utc> },
    /// pending -> pending, retries + 1
    Retry {
        retries: i32,
        last_error: String,
        next_attempt_at: Option<DateTime<Utc>>,
    },
    /// pending -> failed
    Fail {
        retries: i32,
        last_error: String,
        at: DateTime<Utc>,
    },
}

impl Transition {
    pub fn target_status(&self) -> JobStatus {
        match self {
            Transition::Complete { .. } => JobStatus::Completed,
            Transition::Retry { .. } => JobStatus::Pending,
            Transition::Fail { .. } => JobStatus::Failed,
        }
    }

    /// Writes the transition onto an in-memory copy of the job.
    pub fn apply_to(&self, job: &mut Job, now: DateTime<Utc>) {
        match self {
            Transition::Complete { at } => {
                job.status = JobStatus::Completed;
                job.last_error = None;
                job.completed_at = Some(*at);
                job.next_attempt_at = None;
            }
            Transition::Retry {
                retries,
                last_error,
                next_attempt_at,
            } => {
                job.status = JobStatus::Pending;
                job.retries = *retries;
                job.last_error = Some(last_error.clone());
                job.completed_at = None;
                job.next_attempt_at = *next_attempt_at;
            }
            Transition::Fail {
                retries,
                last_error,
                at,
            } => {
                job.status = JobStatus::Failed;
                job.retries = *retries;
                job.last_error = Some(last_error.clone());
                job.completed_at = Some(*at);
                job.next_attempt_at = None;
            }
        }
        job.locked_by = None;
        job.lock_expires_at = None;
        job.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn pending_job(now: DateTime<Utc>) -> Job {
        Job {
            id: Uuid::new_v4(),
            webhook_url: "http://localhost/hook".into(),
            payload: json!({"a": 1}),
            scheduled_time: now - Duration::seconds(1),
            status: JobStatus::Pending,
            retries: 0,
            last_error: None,
            created_at: now,
            completed_at: None,
            next_attempt_at: None,
            locked_by: None,
            lock_expires_at: None,
            updated_at: now,
        }
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("Pending".parse::<JobStatus>().unwrap(), JobStatus::Pending);
        assert_eq!(" failed ".parse::<JobStatus>().unwrap(), JobStatus::Failed);
        assert!("running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn due_requires_pending_and_past_schedule() {
        let now = Utc::now();
        let mut job = pending_job(now);
        assert!(job.is_due(now));

        job.scheduled_time = now + Duration::seconds(5);
        assert!(!job.is_due(now));

        job.scheduled_time = now;
        job.status = JobStatus::Completed;
        assert!(!job.is_due(now));
    }

    #[test]
    fn backoff_delays_eligibility() {
        let now = Utc::now();
        let mut job = pending_job(now);
        job.next_attempt_at = Some(now + Duration::seconds(30));
        assert!(!job.is_due(now));
        assert!(job.is_due(now + Duration::seconds(30)));
    }

    #[test]
    fn terminal_transitions_stamp_completed_at_and_release_lease() {
        let now = Utc::now();
        let mut job = pending_job(now);
        job.locked_by = Some("worker-a".into());
        job.lock_expires_at = Some(now + Duration::seconds(60));
        job.last_error = Some("boom".into());

        Transition::Complete { at: now }.apply_to(&mut job, now);

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.completed_at, Some(now));
        assert_eq!(job.last_error, None);
        assert_eq!(job.locked_by, None);
        assert_eq!(job.lock_expires_at, None);
    }
}
