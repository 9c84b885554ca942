use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::Value;
use tracing::{error, info};
use uuid::Uuid;

use crate::api::models::{
    DeleteJobResponse, ErrorBody, JobResponse, JobView, ListJobsQuery, ListJobsResponse,
    ScheduleRequest, ScheduleResponse,
};
use crate::api::schedule_time::parse_schedule_time;
use crate::jobs::{JobStatus, JobStore, JobStoreError, NewJob};

pub mod models;
pub mod schedule_time;

pub const API_KEY_HEADER: &str = "X-API-KEY";

#[derive(Clone)]
pub struct ApiState {
    pub jobs: Arc<dyn JobStore>,
    /// When set, every `/api` route requires a matching `X-API-KEY` header.
    pub api_key: Option<String>,
}

pub fn router(state: ApiState) -> Router {
    let api = Router::new()
        .route("/schedule", post(schedule_job))
        .route("/jobs", get(list_jobs))
        .route("/jobs/:id/retry", post(retry_job))
        .route("/jobs/:id/delete", delete(delete_job))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .nest("/api", api)
        .with_state(state)
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn api_err(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            error: error.into(),
            details: None,
        }),
    )
}

fn bad_request(error: impl Into<String>) -> ApiError {
    api_err(StatusCode::BAD_REQUEST, error)
}

/// Maps store failures onto HTTP; `context` is the generic message used for
/// server-side errors.
fn store_err(context: &str, e: JobStoreError) -> ApiError {
    match e {
        JobStoreError::NotFound(_) => api_err(StatusCode::NOT_FOUND, "Job not found"),
        JobStoreError::NotRetryable { .. } | JobStoreError::Stale { .. } => {
            api_err(StatusCode::CONFLICT, e.to_string())
        }
        other => {
            error!(error = %other, "{context}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: context.to_string(),
                    details: Some(other.to_string()),
                }),
            )
        }
    }
}

fn parse_job_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw.trim()).map_err(|_| bad_request("Job id must be a valid UUID"))
}

async fn require_api_key(State(state): State<ApiState>, req: Request, next: Next) -> Response {
    if let Some(expected) = state.api_key.as_deref() {
        let provided = req
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok());
        if provided != Some(expected) {
            return api_err(StatusCode::UNAUTHORIZED, "Unauthorized: Invalid API key")
                .into_response();
        }
    }
    next.run(req).await
}

pub async fn index() -> &'static str {
    "cronhook API is running"
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub async fn schedule_job(
    State(state): State<ApiState>,
    body: Result<Json<ScheduleRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ScheduleResponse>), ApiError> {
    let Json(body) = body.map_err(|e| bad_request(format!("invalid JSON body: {}", e.body_text())))?;

    let webhook_url = match body.webhook_url {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        _ => return Err(bad_request("webhook_url is required and must be a string")),
    };
    match url::Url::parse(&webhook_url) {
        Ok(u) if matches!(u.scheme(), "http" | "https") && u.has_host() => {}
        _ => return Err(bad_request("webhook_url must be an absolute http(s) URL")),
    }

    let payload = match body.payload {
        Some(v @ (Value::Object(_) | Value::Array(_))) => v,
        _ => return Err(bad_request("payload is required and must be an object")),
    };

    let scheduled_time = match body.scheduled_time {
        Some(Value::String(s)) => s,
        _ => {
            return Err(bad_request(
                "scheduled_time is required and must be a string in format dd-mm-yyyy HH:mm",
            ))
        }
    };
    let scheduled_time = parse_schedule_time(&scheduled_time, body.timezone.as_deref())
        .map_err(|e| bad_request(e.to_string()))?;

    let job = state
        .jobs
        .insert(NewJob {
            webhook_url,
            payload,
            scheduled_time,
        })
        .await
        .map_err(|e| store_err("Failed to schedule job", e))?;

    info!(job_id = %job.id, scheduled_time = %job.scheduled_time, "job scheduled");

    Ok((StatusCode::CREATED, Json(ScheduleResponse { id: job.id })))
}

pub async fn list_jobs(
    State(state): State<ApiState>,
    Query(q): Query<ListJobsQuery>,
) -> Result<Json<ListJobsResponse>, ApiError> {
    let status = match q.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => Some(
            raw.parse::<JobStatus>()
                .map_err(|e| bad_request(e.to_string()))?,
        ),
        None => None,
    };

    let jobs = state
        .jobs
        .list(status)
        .await
        .map_err(|e| store_err("Failed to fetch jobs", e))?;

    Ok(Json(ListJobsResponse {
        jobs: jobs.into_iter().map(JobView::from).collect(),
    }))
}

pub async fn retry_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let id = parse_job_id(&id)?;

    let job = state
        .jobs
        .reset_for_retry(id)
        .await
        .map_err(|e| store_err("Failed to retry job", e))?;

    info!(job_id = %job.id, "job reset for retry");

    Ok(Json(JobResponse { job: job.into() }))
}

pub async fn delete_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteJobResponse>, ApiError> {
    let id = parse_job_id(&id)?;

    let job = state
        .jobs
        .delete(id)
        .await
        .map_err(|e| store_err("Failed to delete job", e))?;

    info!(job_id = %job.id, "job deleted");

    Ok(Json(DeleteJobResponse {
        message: "Job deleted".to_string(),
        job: job.into(),
    }))
}
