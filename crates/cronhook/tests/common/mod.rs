#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cronhook::jobs::{
    DeliveryError, DispatchConfig, Dispatcher, DueQuery, Job, JobStatus, JobStore,
    JobStoreError, MemoryJobStore, NewJob, Transition, WebhookSender,
};
use serde_json::{json, Value};
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

/// Connects to `TEST_DATABASE_URL`, migrates and empties the jobs table.
///
/// Returns `None` when the variable is unset so Postgres-backed tests can be
/// skipped on machines without a database.
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set; skipping Postgres test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    sqlx::query("TRUNCATE TABLE jobs")
        .execute(&pool)
        .await
        .expect("truncate failed");

    Some(pool)
}

pub fn new_job(url: &str, scheduled_time: DateTime<Utc>, seq: i64) -> NewJob {
    NewJob {
        webhook_url: url.to_string(),
        payload: json!({ "seq": seq }),
        scheduled_time,
    }
}

pub fn dispatch_config(max_retry_attempts: i32) -> DispatchConfig {
    DispatchConfig::new("test-worker", Duration::from_millis(50), max_retry_attempts)
}

pub fn dispatcher(
    store: Arc<dyn JobStore>,
    sender: Arc<dyn WebhookSender>,
    cfg: DispatchConfig,
) -> Dispatcher {
    Dispatcher::new(store, sender, cfg)
}

pub async fn reload(store: &dyn JobStore, id: Uuid) -> Job {
    store
        .get(id)
        .await
        .expect("get failed")
        .expect("job missing")
}

/// Sender that records every call and fails for URLs marked as broken.
#[derive(Default)]
pub struct RecordingSender {
    calls: Mutex<Vec<(String, Value)>>,
    failing: Mutex<HashMap<String, DeliveryError>>,
}

impl RecordingSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every later call to `url` answers with a 500 carrying `body`.
    pub fn fail_with(&self, url: &str, body: Option<&str>) {
        self.failing.lock().unwrap().insert(
            url.to_string(),
            DeliveryError::Status {
                status: 500,
                body: body.map(str::to_string),
            },
        );
    }

    pub fn heal(&self, url: &str) {
        self.failing.lock().unwrap().remove(url);
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// `payload.seq` of every call, in call order.
    pub fn seqs(&self) -> Vec<i64> {
        self.calls()
            .iter()
            .filter_map(|(_, p)| p.get("seq").and_then(Value::as_i64))
            .collect()
    }
}

#[async_trait]
impl WebhookSender for RecordingSender {
    async fn send(&self, url: &str, payload: &Value) -> Result<(), DeliveryError> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), payload.clone()));

        match self.failing.lock().unwrap().get(url) {
            Some(DeliveryError::Status { status, body }) => Err(DeliveryError::Status {
                status: *status,
                body: body.clone(),
            }),
            Some(other) => Err(DeliveryError::Transport(other.to_string())),
            None => Ok(()),
        }
    }
}

/// Sender that deletes the job it is delivering, simulating an operator
/// removing it mid-flight.
pub struct DeletingSender {
    pub store: Arc<MemoryJobStore>,
    pub id: Uuid,
}

#[async_trait]
impl WebhookSender for DeletingSender {
    async fn send(&self, _url: &str, _payload: &Value) -> Result<(), DeliveryError> {
        self.store.delete(self.id).await.expect("delete failed");
        Ok(())
    }
}

/// Sender that takes `delay` per call and tracks how many calls overlap.
pub struct SlowSender {
    delay: Duration,
    failing: bool,
    seqs: Mutex<Vec<i64>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SlowSender {
    pub fn new(delay: Duration) -> Arc<Self> {
        Self::build(delay, false)
    }

    /// Every call answers with a 503 after the delay.
    pub fn failing(delay: Duration) -> Arc<Self> {
        Self::build(delay, true)
    }

    fn build(delay: Duration, failing: bool) -> Arc<Self> {
        Arc::new(Self {
            delay,
            failing,
            seqs: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn seqs(&self) -> Vec<i64> {
        self.seqs.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.seqs.lock().unwrap().len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WebhookSender for SlowSender {
    async fn send(&self, _url: &str, payload: &Value) -> Result<(), DeliveryError> {
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        self.seqs
            .lock()
            .unwrap()
            .push(payload.get("seq").and_then(Value::as_i64).unwrap_or(-1));

        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing {
            Err(DeliveryError::Status {
                status: 503,
                body: None,
            })
        } else {
            Ok(())
        }
    }
}

/// Wraps [`MemoryJobStore`] and fails claims and/or writes on demand.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryJobStore,
    pub fail_claims: AtomicBool,
    pub fail_writes: AtomicBool,
    fail_claims_after_first: AtomicBool,
    claimed_once: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The first claim of each sweep succeeds, later pages fail.
    pub fn fail_later_pages(&self) {
        self.fail_claims_after_first.store(true, Ordering::SeqCst);
    }

    fn unavailable() -> JobStoreError {
        JobStoreError::Unavailable("connection refused".into())
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn insert(&self, job: NewJob) -> Result<Job, JobStoreError> {
        self.inner.insert(job).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, JobStoreError> {
        self.inner.get(id).await
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>, JobStoreError> {
        self.inner.list(status).await
    }

    async fn claim_due(&self, query: DueQuery<'_>) -> Result<Vec<Job>, JobStoreError> {
        if self.fail_claims.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        if self.fail_claims_after_first.load(Ordering::SeqCst)
            && self.claimed_once.swap(true, Ordering::SeqCst)
        {
            return Err(Self::unavailable());
        }
        self.inner.claim_due(query).await
    }

    async fn renew_lease(
        &self,
        id: Uuid,
        worker_id: &str,
        expected_retries: i32,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        self.inner
            .renew_lease(id, worker_id, expected_retries, now, lease_until)
            .await
    }

    async fn apply_transition(
        &self,
        id: Uuid,
        worker_id: &str,
        expected_retries: i32,
        transition: &Transition,
    ) -> Result<Job, JobStoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner
            .apply_transition(id, worker_id, expected_retries, transition)
            .await
    }

    async fn reset_for_retry(&self, id: Uuid) -> Result<Job, JobStoreError> {
        self.inner.reset_for_retry(id).await
    }

    async fn delete(&self, id: Uuid) -> Result<Job, JobStoreError> {
        self.inner.delete(id).await
    }
}

pub fn ids(jobs: &[Job]) -> HashSet<Uuid> {
    jobs.iter().map(|j| j.id).collect()
}
