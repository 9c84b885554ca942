use std::time::Duration;

use anyhow::{anyhow, bail, Context};

use crate::jobs::delivery::DELIVERY_TIMEOUT;
use crate::jobs::dispatcher::DispatchConfig;
use crate::jobs::retry::{RetryConfig, RetryPolicy};

const DEFAULT_API_ADDR: &str = "0.0.0.0:3000";

/// Runtime configuration, loaded once at startup and passed down explicitly.
#[derive(Clone, Debug)]
pub struct Config {
    /// Required unless the worker runs with the in-memory store.
    pub database_url: Option<String>,
    pub worker_id: String,
    pub poll_interval_secs: u64,
    pub max_retry_attempts: i32,
    pub api_addr: Option<String>,
    /// Always set while the API is enabled, unless `API_AUTH=off`.
    pub api_key: Option<String>,
    pub dispatch_batch_size: i64,
    pub max_concurrent_deliveries: usize,
    pub lease_seconds: i64,
    pub migrate_on_startup: bool,
    pub retry_backoff: RetryConfig,
}

impl Config {
    /// Reads the process environment (and `.env`, if present).
    ///
    /// Invalid or missing required settings are errors; callers treat them
    /// as fatal.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`Config::from_env`] with the management API forced off, for
    /// processes that only dispatch.
    pub fn from_env_without_api() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(api_off(|key| std::env::var(key).ok()))
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let env = |key: &str| get(key).filter(|s| !s.trim().is_empty());

        let database_url = env("DATABASE_URL");

        let worker_id = env("WORKER_ID")
            .or_else(|| env("HOSTNAME"))
            .unwrap_or_else(|| "worker-1".to_string());

        let poll_interval_secs: u64 =
            required_positive(&env, "WORKER_POLL_INTERVAL_SECONDS")?;
        let max_retry_attempts: i32 = required_positive(&env, "MAX_RETRY_ATTEMPTS")?;

        let api_addr = match env("API_ADDR") {
            Some(addr) => normalize_optional_addr(&addr),
            None => match env("PORT") {
                Some(port) => {
                    let port: u16 = port
                        .trim()
                        .parse()
                        .map_err(|_| anyhow!("PORT must be a valid port number, got `{port}`"))?;
                    Some(format!("0.0.0.0:{port}"))
                }
                None => Some(DEFAULT_API_ADDR.to_string()),
            },
        };

        let api_key = env("PRIVATE_API_KEY");
        let auth_disabled = env("API_AUTH")
            .is_some_and(|v| matches!(v.trim().to_lowercase().as_str(), "off" | "0" | "false" | "none"));
        if api_addr.is_some() && api_key.is_none() && !auth_disabled {
            bail!(
                "PRIVATE_API_KEY is required when the API is enabled \
                 (set API_ADDR=off to disable the API, or API_AUTH=off to run it unauthenticated)"
            );
        }

        let dispatch_batch_size: i64 =
            optional_positive(&env, "DISPATCH_BATCH_SIZE")?.unwrap_or(100);
        let max_concurrent_deliveries: usize =
            optional_positive(&env, "MAX_CONCURRENT_DELIVERIES")?.unwrap_or(1);

        let lease_seconds: i64 = optional_positive(&env, "LEASE_SECONDS")?.unwrap_or(60);
        if lease_seconds as u64 <= DELIVERY_TIMEOUT.as_secs() {
            bail!(
                "LEASE_SECONDS must be greater than the delivery timeout ({}s), got {lease_seconds}",
                DELIVERY_TIMEOUT.as_secs()
            );
        }

        let migrate_on_startup = env_bool(&env, "MIGRATE_ON_STARTUP").unwrap_or(false);

        let retry_backoff = retry_backoff(&env)?;

        Ok(Self {
            database_url,
            worker_id,
            poll_interval_secs,
            max_retry_attempts,
            api_addr,
            api_key,
            dispatch_batch_size,
            max_concurrent_deliveries,
            lease_seconds,
            migrate_on_startup,
            retry_backoff,
        })
    }

    pub fn database_url(&self) -> anyhow::Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| anyhow!("DATABASE_URL is missing"))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            worker_id: self.worker_id.clone(),
            poll_interval: self.poll_interval(),
            retry: RetryPolicy::new(self.max_retry_attempts)
                .with_backoff(self.retry_backoff.clone()),
            batch_size: self.dispatch_batch_size,
            max_concurrent: self.max_concurrent_deliveries,
            lease_seconds: self.lease_seconds,
        }
    }
}

fn api_off(get: impl Fn(&str) -> Option<String>) -> impl Fn(&str) -> Option<String> {
    move |key: &str| match key {
        "API_ADDR" => Some("off".to_string()),
        _ => get(key),
    }
}

fn retry_backoff(env: &impl Fn(&str) -> Option<String>) -> anyhow::Result<RetryConfig> {
    let defaults = RetryConfig::default();

    let base_seconds: i64 = match env("RETRY_BACKOFF_BASE_SECONDS") {
        Some(raw) => parse_num(&raw, "RETRY_BACKOFF_BASE_SECONDS")?,
        None => defaults.base_seconds,
    };
    if base_seconds < 0 {
        bail!("RETRY_BACKOFF_BASE_SECONDS must not be negative");
    }

    let max_seconds: i64 = match env("RETRY_BACKOFF_MAX_SECONDS") {
        Some(raw) => parse_num(&raw, "RETRY_BACKOFF_MAX_SECONDS")?,
        None => defaults.max_seconds,
    };
    if max_seconds < base_seconds {
        bail!("RETRY_BACKOFF_MAX_SECONDS must be >= RETRY_BACKOFF_BASE_SECONDS");
    }

    let jitter_pct: f64 = match env("RETRY_BACKOFF_JITTER_PCT") {
        Some(raw) => parse_num(&raw, "RETRY_BACKOFF_JITTER_PCT")?,
        None => defaults.jitter_pct,
    };
    if !(0.0..=1.0).contains(&jitter_pct) {
        bail!("RETRY_BACKOFF_JITTER_PCT must be between 0.0 and 1.0");
    }

    Ok(RetryConfig {
        base_seconds,
        max_seconds,
        jitter_pct,
    })
}

fn parse_num<T: std::str::FromStr>(raw: &str, key: &str) -> anyhow::Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| anyhow!("{key} must be a number, got `{raw}`"))
}

fn required_positive<T>(env: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<T>
where
    T: TryFrom<i64>,
{
    let raw = env(key).with_context(|| format!("Environment variable {key} is required but not set"))?;
    positive(&raw, key)
}

fn optional_positive<T>(env: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: TryFrom<i64>,
{
    env(key).map(|raw| positive(&raw, key)).transpose()
}

fn positive<T: TryFrom<i64>>(raw: &str, key: &str) -> anyhow::Result<T> {
    let n: i64 = raw
        .trim()
        .parse()
        .map_err(|_| anyhow!("{key} must be a positive number, got `{raw}`"))?;
    if n <= 0 {
        bail!("{key} must be a positive number, got {n}");
    }
    T::try_from(n).map_err(|_| anyhow!("{key} is out of range: {n}"))
}

fn env_bool(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    env(key).map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
