//! Polling dispatch loop: find due jobs, deliver, write back the transition.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, SeedableRng};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::jobs::delivery::WebhookSender;
use crate::jobs::model::{Job, Transition};
use crate::jobs::retry::{AttemptOutcome, RetryPolicy};
use crate::jobs::store::{DueQuery, JobStore, JobStoreError};

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub worker_id: String,
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    /// Page size of one due-job claim.
    pub batch_size: i64,
    pub max_concurrent: usize,
    pub lease_seconds: i64,
}

impl DispatchConfig {
    pub fn new(worker_id: impl Into<String>, poll_interval: Duration, max_retry_attempts: i32) -> Self {
        Self {
            worker_id: worker_id.into(),
            poll_interval,
            retry: RetryPolicy::new(max_retry_attempts),
            batch_size: 100,
            max_concurrent: 1,
            lease_seconds: 60,
        }
    }
}

/// Counters for one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweepReport {
    pub attempted: usize,
    pub completed: usize,
    pub retrying: usize,
    pub failed: usize,
    /// Transitions skipped because the job changed underneath the worker.
    pub stale: usize,
    /// Transitions that could not be written back.
    pub write_errors: usize,
    /// Claimed jobs not delivered because their lease could not be renewed.
    pub skipped: usize,
}

impl SweepReport {
    fn record(&mut self, outcome: &JobOutcome) {
        if let JobOutcome::Skipped = outcome {
            self.skipped += 1;
            return;
        }
        self.attempted += 1;
        match outcome {
            JobOutcome::Written(Transition::Complete { .. }) => self.completed += 1,
            JobOutcome::Written(Transition::Retry { .. }) => self.retrying += 1,
            JobOutcome::Written(Transition::Fail { .. }) => self.failed += 1,
            JobOutcome::Stale => self.stale += 1,
            JobOutcome::WriteFailed => self.write_errors += 1,
            JobOutcome::Skipped => {}
        }
    }
}

enum JobOutcome {
    Written(Transition),
    Stale,
    WriteFailed,
    Skipped,
}

/// Sweep-local time: the sweep's `now` advanced by the wall time spent in it.
#[derive(Debug, Clone, Copy)]
struct SweepClock {
    start: DateTime<Utc>,
    started: Instant,
}

impl SweepClock {
    fn new(start: DateTime<Utc>) -> Self {
        Self {
            start,
            started: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.started.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.start + elapsed
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    sender: Arc<dyn WebhookSender>,
    cfg: DispatchConfig,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn JobStore>, sender: Arc<dyn WebhookSender>, cfg: DispatchConfig) -> Self {
        Self { store, sender, cfg }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.cfg
    }

    /// Runs sweeps every `poll_interval` until `shutdown` resolves.
    ///
    /// A sweep always finishes before the next one starts; ticks missed while
    /// a long sweep runs are delayed, never stacked.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(self.cfg.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            worker_id = %self.cfg.worker_id,
            poll_interval_secs = self.cfg.poll_interval.as_secs(),
            max_retry_attempts = self.cfg.retry.max_attempts,
            batch_size = self.cfg.batch_size,
            "dispatcher started"
        );

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = ticker.tick() => {}
            }

            match self.sweep().await {
                Ok(report) if report.attempted > 0 => {
                    info!(worker_id = %self.cfg.worker_id, ?report, "sweep finished")
                }
                Ok(_) => debug!(worker_id = %self.cfg.worker_id, "no due jobs"),
                Err(e) => {
                    error!(worker_id = %self.cfg.worker_id, error = %e, "due-job query failed; sweep skipped")
                }
            }
        }

        info!(worker_id = %self.cfg.worker_id, "dispatcher stopped");
    }

    /// One scan-and-dispatch cycle at the current wall-clock time.
    pub async fn sweep(&self) -> Result<SweepReport, JobStoreError> {
        self.sweep_at(Utc::now()).await
    }

    /// One scan-and-dispatch cycle treating `now` as the current time.
    ///
    /// Claims due jobs page by page (earliest `scheduled_time` first) and
    /// attempts each exactly once. Fails only if the first claim fails, in
    /// which case no job state was touched.
    ///
    /// Each page is leased from the sweep's current time, and every job's
    /// lease is renewed right before its delivery. A job whose lease was taken
    /// over by another worker in the meantime is skipped, not delivered.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, JobStoreError> {
        let clock = SweepClock::new(now);
        let mut report = SweepReport::default();
        let mut handled: Vec<Uuid> = Vec::new();
        let limit = self.cfg.batch_size.max(1);

        loop {
            let page = self
                .store
                .claim_due(DueQuery {
                    now,
                    worker_id: &self.cfg.worker_id,
                    lease_until: self.lease_until(clock.now()),
                    limit,
                    exclude: &handled,
                })
                .await;

            let page = match page {
                Ok(page) => page,
                Err(e) if handled.is_empty() => return Err(e),
                Err(e) => {
                    warn!(worker_id = %self.cfg.worker_id, error = %e, "next page query failed; ending sweep early");
                    break;
                }
            };

            let full_page = page.len() as i64 >= limit;
            handled.extend(page.iter().map(|j| j.id));
            self.dispatch_page(page, clock, &mut report).await;

            if !full_page {
                break;
            }
        }

        Ok(report)
    }

    fn lease_until(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        at + chrono::Duration::seconds(self.cfg.lease_seconds)
    }

    async fn dispatch_page(&self, page: Vec<Job>, clock: SweepClock, report: &mut SweepReport) {
        if page.is_empty() {
            return;
        }

        // Permits are taken in page order, so deliveries start in
        // scheduled_time order even when they overlap.
        let permits = Arc::new(Semaphore::new(self.cfg.max_concurrent.max(1)));
        let mut join_set = JoinSet::new();

        for job in page {
            let permit = match permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let this = self.clone();
            join_set.spawn(async move {
                let _permit = permit;
                this.process_job(job, clock).await
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(outcome) => report.record(&outcome),
                Err(e) => {
                    error!(worker_id = %self.cfg.worker_id, error = %e, "delivery task panicked");
                    report.attempted += 1;
                    report.write_errors += 1;
                }
            }
        }
    }

    async fn process_job(&self, job: Job, clock: SweepClock) -> JobOutcome {
        let worker_id = self.cfg.worker_id.as_str();

        let at = clock.now();
        match self
            .store
            .renew_lease(job.id, worker_id, job.retries, at, self.lease_until(at))
            .await
        {
            Ok(_) => {}
            Err(e @ (JobStoreError::Stale { .. } | JobStoreError::NotFound(_))) => {
                debug!(worker_id, job_id = %job.id, error = %e, "lease lost before delivery; skipped");
                return JobOutcome::Skipped;
            }
            Err(e) => {
                warn!(worker_id, job_id = %job.id, error = %e, "lease renewal failed; skipped");
                return JobOutcome::Skipped;
            }
        }

        debug!(
            worker_id,
            job_id = %job.id,
            url = %job.webhook_url,
            retries = job.retries,
            "delivering"
        );

        let outcome = match self.sender.send(&job.webhook_url, &job.payload).await {
            Ok(()) => AttemptOutcome::Delivered,
            Err(e) => AttemptOutcome::Failed { error: e.summary() },
        };

        let transition = {
            let mut rng = StdRng::from_entropy();
            self.cfg
                .retry
                .decide(job.retries, outcome, Utc::now(), &mut rng)
        };

        match self
            .store
            .apply_transition(job.id, worker_id, job.retries, &transition)
            .await
        {
            Ok(_) => {
                log_transition(worker_id, &job, &transition);
                JobOutcome::Written(transition)
            }
            Err(e @ (JobStoreError::Stale { .. } | JobStoreError::NotFound(_))) => {
                warn!(worker_id, job_id = %job.id, error = %e, "job changed during delivery; transition skipped");
                JobOutcome::Stale
            }
            Err(e) => {
                // The webhook may already have fired; the job stays pending
                // and will be delivered again on a later sweep.
                error!(
                    worker_id,
                    job_id = %job.id,
                    target_status = %transition.target_status(),
                    error = %e,
                    "failed to write job transition"
                );
                JobOutcome::WriteFailed
            }
        }
    }
}

fn log_transition(worker_id: &str, job: &Job, transition: &Transition) {
    match transition {
        Transition::Complete { .. } => {
            info!(worker_id, job_id = %job.id, "job completed")
        }
        Transition::Retry {
            retries,
            last_error,
            next_attempt_at,
        } => warn!(
            worker_id,
            job_id = %job.id,
            retries,
            error = %last_error,
            next_attempt_at = ?next_attempt_at,
            "delivery failed; will retry"
        ),
        Transition::Fail {
            retries,
            last_error,
            ..
        } => error!(
            worker_id,
            job_id = %job.id,
            retries,
            error = %last_error,
            "delivery failed; retries exhausted"
        ),
    }
}
