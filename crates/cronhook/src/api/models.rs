// crates/cronhook/src/api/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::jobs::{Job, JobStatus};

/// Job as exposed by the management API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub id: Uuid,
    pub webhook_url: String,
    pub payload: Value,
    pub scheduled_time: DateTime<Utc>,
    pub status: JobStatus,
    pub retries: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            webhook_url: job.webhook_url,
            payload: job.payload,
            scheduled_time: job.scheduled_time,
            status: job.status,
            retries: job.retries,
            last_error: job.last_error,
            created_at: job.created_at,
            completed_at: job.completed_at,
            next_attempt_at: job.next_attempt_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub webhook_url: Option<Value>,
    pub payload: Option<Value>,
    pub scheduled_time: Option<Value>,
    pub timezone: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScheduleResponse {
    pub id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListJobsResponse {
    pub jobs: Vec<JobView>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobResponse {
    pub job: JobView,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteJobResponse {
    pub message: String,
    pub job: JobView,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}
