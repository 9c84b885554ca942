use chrono::{DateTime, Utc};
use rand::Rng;

use crate::jobs::model::Transition;

/// Optional spacing between retries. `base_seconds == 0` disables backoff,
/// so a failed job is retried on the very next sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub base_seconds: i64,
    pub max_seconds: i64,
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_seconds: 0,
            max_seconds: 15 * 60,
            jitter_pct: 0.20,
        }
    }
}

impl RetryConfig {
    pub fn is_enabled(&self) -> bool {
        self.base_seconds > 0
    }
}

/// Bounded retry policy: at most `max_attempts` failed deliveries per job.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub backoff: RetryConfig,
}

/// Result of one delivery attempt as seen by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Delivered,
    Failed { error: String },
}

impl RetryPolicy {
    pub fn new(max_attempts: i32) -> Self {
        Self {
            max_attempts,
            backoff: RetryConfig::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: RetryConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Picks the single transition for a pending job that had `retries`
    /// failed attempts before this one.
    pub fn decide(
        &self,
        retries: i32,
        outcome: AttemptOutcome,
        now: DateTime<Utc>,
        rng: &mut impl Rng,
    ) -> Transition {
        match outcome {
            AttemptOutcome::Delivered => Transition::Complete { at: now },
            AttemptOutcome::Failed { error } => {
                let retries = retries.saturating_add(1);
                if retries >= self.max_attempts {
                    Transition::Fail {
                        retries,
                        last_error: error,
                        at: now,
                    }
                } else {
                    let next_attempt_at = next_delay_seconds(retries, &self.backoff, rng)
                        .map(|secs| now + chrono::Duration::seconds(secs));
                    Transition::Retry {
                        retries,
                        last_error: error,
                        next_attempt_at,
                    }
                }
            }
        }
    }
}

/// Exponential delay `base * 2^(attempt_no - 1)`, capped, with symmetric
/// jitter. `None` when backoff is disabled.
pub fn next_delay_seconds(attempt_no: i32, cfg: &RetryConfig, rng: &mut impl Rng) -> Option<i64> {
    if !cfg.is_enabled() {
        return None;
    }

    let attempt_no = attempt_no.max(1) as u32;
    let exp = attempt_no.saturating_sub(1);

    // Too-large exponents saturate and the cap takes over.
    let pow2 = 1_i64.checked_shl(exp).unwrap_or(i64::MAX);
    let delay = cfg.base_seconds.saturating_mul(pow2).min(cfg.max_seconds);

    let jitter_range = (delay as f64) * cfg.jitter_pct;
    let jitter = if jitter_range > 0.0 {
        rng.gen_range(-jitter_range..=jitter_range)
    } else {
        0.0
    };

    let jittered = (delay as f64 + jitter).round() as i64;
    Some(jittered.clamp(0, cfg.max_seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn failed(msg: &str) -> AttemptOutcome {
        AttemptOutcome::Failed { error: msg.into() }
    }

    #[test]
    fn success_completes_without_touching_retries() {
        let now = Utc::now();
        let t = RetryPolicy::new(3).decide(2, AttemptOutcome::Delivered, now, &mut rng());
        assert_eq!(t, Transition::Complete { at: now });
    }

    #[test]
    fn failure_below_threshold_stays_pending() {
        let now = Utc::now();
        let t = RetryPolicy::new(3).decide(0, failed("boom"), now, &mut rng());
        assert_eq!(
            t,
            Transition::Retry {
                retries: 1,
                last_error: "boom".into(),
                next_attempt_at: None,
            }
        );
    }

    #[test]
    fn failure_reaching_threshold_fails_permanently() {
        let now = Utc::now();
        let t = RetryPolicy::new(3).decide(2, failed("boom"), now, &mut rng());
        assert_eq!(
            t,
            Transition::Fail {
                retries: 3,
                last_error: "boom".into(),
                at: now,
            }
        );
    }

    #[test]
    fn single_attempt_policy_fails_on_first_error() {
        let now = Utc::now();
        let t = RetryPolicy::new(1).decide(0, failed("x"), now, &mut rng());
        assert!(matches!(t, Transition::Fail { retries: 1, .. }));
    }

    #[test]
    fn backoff_disabled_by_default() {
        assert_eq!(next_delay_seconds(3, &RetryConfig::default(), &mut rng()), None);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = RetryConfig {
            base_seconds: 2,
            max_seconds: 10,
            jitter_pct: 0.0,
        };
        let mut r = rng();
        assert_eq!(next_delay_seconds(1, &cfg, &mut r), Some(2));
        assert_eq!(next_delay_seconds(2, &cfg, &mut r), Some(4));
        assert_eq!(next_delay_seconds(3, &cfg, &mut r), Some(8));
        assert_eq!(next_delay_seconds(4, &cfg, &mut r), Some(10));
        assert_eq!(next_delay_seconds(200, &cfg, &mut r), Some(10));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let cfg = RetryConfig {
            base_seconds: 100,
            max_seconds: 1000,
            jitter_pct: 0.2,
        };
        let mut r = rng();
        for _ in 0..100 {
            let d = next_delay_seconds(1, &cfg, &mut r).unwrap();
            assert!((80..=120).contains(&d), "delay {d} outside jitter band");
        }
    }

    #[test]
    fn backoff_schedules_next_attempt() {
        let now = Utc::now();
        let policy = RetryPolicy::new(5).with_backoff(RetryConfig {
            base_seconds: 30,
            max_seconds: 600,
            jitter_pct: 0.0,
        });
        let t = policy.decide(1, failed("later"), now, &mut rng());
        assert_eq!(
            t,
            Transition::Retry {
                retries: 2,
                last_error: "later".into(),
                next_attempt_at: Some(now + chrono::Duration::seconds(60)),
            }
        );
    }
}
