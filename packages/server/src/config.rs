use std::env;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dotenvy::dotenv;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub runtime: RuntimeSettings,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            runtime: RuntimeSettings::from_env()?,
        })
    }
}

/// Tunables for the run execution engine.
///
/// Every knob is overridable via an `AGENT_RUNTIME_*` environment variable;
/// the defaults below are the documented operating point.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Max worker silence before the lease is considered lost.
    pub lease_ttl: Duration,
    /// How often a running worker renews its lease.
    pub heartbeat_interval: Duration,
    /// Per-run wall-clock deadline.
    pub run_timeout: Duration,
    /// Per LM/tool call deadline, enforced by agent callbacks.
    pub step_timeout: Duration,
    /// Retry ceiling for newly submitted runs.
    pub default_max_attempts: i32,
    /// Exponent base for retry backoff.
    pub retry_backoff_base: f64,
    /// Cap on the retry backoff delay.
    pub retry_backoff_max: Duration,
    /// Max in-flight runs per worker.
    pub worker_concurrency: usize,
    /// Whether high-volume `token.delta` events are persisted or live-only.
    pub persist_token_deltas: bool,
    /// SSE idle keepalive interval.
    pub sse_keepalive: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            run_timeout: Duration::from_secs(900),
            step_timeout: Duration::from_secs(120),
            default_max_attempts: 3,
            retry_backoff_base: 2.0,
            retry_backoff_max: Duration::from_secs(300),
            worker_concurrency: 10,
            persist_token_deltas: false,
            sse_keepalive: Duration::from_secs(15),
        }
    }
}

impl RuntimeSettings {
    /// Build settings from defaults plus `AGENT_RUNTIME_*` overrides.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let settings = Self {
            lease_ttl: env_duration_secs("AGENT_RUNTIME_LEASE_TTL", defaults.lease_ttl)?,
            heartbeat_interval: env_duration_secs(
                "AGENT_RUNTIME_HEARTBEAT_INTERVAL",
                defaults.heartbeat_interval,
            )?,
            run_timeout: env_duration_secs("AGENT_RUNTIME_RUN_TIMEOUT", defaults.run_timeout)?,
            step_timeout: env_duration_secs("AGENT_RUNTIME_STEP_TIMEOUT", defaults.step_timeout)?,
            default_max_attempts: env_parse(
                "AGENT_RUNTIME_DEFAULT_MAX_ATTEMPTS",
                defaults.default_max_attempts,
            )?,
            retry_backoff_base: env_parse(
                "AGENT_RUNTIME_RETRY_BACKOFF_BASE",
                defaults.retry_backoff_base,
            )?,
            retry_backoff_max: env_duration_secs(
                "AGENT_RUNTIME_RETRY_BACKOFF_MAX",
                defaults.retry_backoff_max,
            )?,
            worker_concurrency: env_parse(
                "AGENT_RUNTIME_WORKER_CONCURRENCY",
                defaults.worker_concurrency,
            )?,
            persist_token_deltas: env_parse(
                "AGENT_RUNTIME_PERSIST_TOKEN_DELTAS",
                defaults.persist_token_deltas,
            )?,
            sse_keepalive: env_duration_secs("AGENT_RUNTIME_SSE_KEEPALIVE", defaults.sse_keepalive)?,
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Reject configurations that cannot operate safely.
    pub fn validate(&self) -> Result<()> {
        if self.default_max_attempts < 1 {
            bail!("AGENT_RUNTIME_DEFAULT_MAX_ATTEMPTS must be at least 1");
        }
        if self.worker_concurrency < 1 {
            bail!("AGENT_RUNTIME_WORKER_CONCURRENCY must be at least 1");
        }
        if self.retry_backoff_base < 1.0 {
            bail!("AGENT_RUNTIME_RETRY_BACKOFF_BASE must be >= 1.0");
        }
        // The lease must outlive the renewal cadence or every run loses its
        // lease between heartbeats.
        if self.heartbeat_interval >= self.lease_ttl {
            bail!("AGENT_RUNTIME_HEARTBEAT_INTERVAL must be shorter than AGENT_RUNTIME_LEASE_TTL");
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{} is invalid: {}", key, e)),
        Err(_) => Ok(default),
    }
}

fn env_duration_secs(key: &str, default: Duration) -> Result<Duration> {
    let secs: u64 = env_parse(key, default.as_secs())?;
    Ok(Duration::from_secs(secs))
}
