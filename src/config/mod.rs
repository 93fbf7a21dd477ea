//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or malformed.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use crate::error::{Error, Result};
use crate::timing::TimingProfile;
use secrecy::SecretString;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub timing_profile: TimingProfile,
    pub queue: QueueConfig,
    pub scanner: ScannerConfig,
    pub tasks: TaskConfig,
    pub mail: MailConfig,
    /// Deadline for one interactive lifecycle operation.
    pub operation_timeout: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

/// Delivery queue and worker settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub max_attempts: u32,
    /// Linear backoff base: the n-th failure waits `retry_base_delay * n`.
    pub retry_base_delay: Duration,
    /// How long a claim holds a row before another worker may reclaim it.
    pub lease: Duration,
    /// Deadline for a single send call.
    pub send_timeout: Duration,
}

impl QueueConfig {
    /// The worker renews a row's lease right before sending it, so the lease
    /// has to outlast one send plus the write that records its outcome.
    /// Attempt counts are stored as `integer`.
    pub fn validate(&self) -> Result<()> {
        if self.lease <= self.send_timeout {
            return Err(Error::Config(format!(
                "QUEUE_LEASE_SECS ({}s) must exceed SEND_TIMEOUT_SECS ({}s)",
                self.lease.as_secs(),
                self.send_timeout.as_secs()
            )));
        }
        if i32::try_from(self.max_attempts).is_err() {
            return Err(Error::Config(format!(
                "QUEUE_MAX_ATTEMPTS ({}) is out of range",
                self.max_attempts
            )));
        }
        Ok(())
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 10,
            max_attempts: crate::model::DEFAULT_MAX_ATTEMPTS,
            retry_base_delay: Duration::from_secs(60),
            lease: Duration::from_secs(300),
            send_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub interval: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Derived-task generation and maintenance.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub sweep_interval: Duration,
    /// How far past due an open task may drift before the sweep expires it.
    pub expiry_grace: chrono::Duration,
    /// No-response events younger than this do not produce a task.
    pub no_response_min_elapsed: chrono::Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(3600),
            expiry_grace: chrono::Duration::hours(168),
            no_response_min_elapsed: chrono::Duration::hours(48),
        }
    }
}

/// Outbound mail transport. Without an API key the send capability counts
/// as not configured and the worker stays idle.
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub api_url: String,
    pub api_key: Option<SecretString>,
    pub from: String,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.resend.com/emails".to_string(),
            api_key: None,
            from: "Follow-ups <followups@localhost>".to_string(),
        }
    }
}

impl MailConfig {
    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        let queue_defaults = QueueConfig::default();
        let scanner_defaults = ScannerConfig::default();
        let task_defaults = TaskConfig::default();
        let mail_defaults = MailConfig::default();

        let queue = QueueConfig {
            poll_interval: secs_var("QUEUE_POLL_INTERVAL_SECS", queue_defaults.poll_interval)?,
            batch_size: parsed_var("QUEUE_BATCH_SIZE", queue_defaults.batch_size)?.max(1),
            max_attempts: parsed_var("QUEUE_MAX_ATTEMPTS", queue_defaults.max_attempts)?.max(1),
            retry_base_delay: secs_var(
                "QUEUE_RETRY_BASE_DELAY_SECS",
                queue_defaults.retry_base_delay,
            )?,
            lease: secs_var("QUEUE_LEASE_SECS", queue_defaults.lease)?,
            send_timeout: secs_var("SEND_TIMEOUT_SECS", queue_defaults.send_timeout)?,
        };
        queue.validate()?;

        let scanner = ScannerConfig {
            interval: secs_var("ESCALATION_SCAN_INTERVAL_SECS", scanner_defaults.interval)?,
        };

        let tasks = TaskConfig {
            sweep_interval: secs_var("TASK_SWEEP_INTERVAL_SECS", task_defaults.sweep_interval)?,
            expiry_grace: hours_var("TASK_EXPIRY_GRACE_HOURS", task_defaults.expiry_grace)?,
            no_response_min_elapsed: hours_var(
                "NO_RESPONSE_MIN_ELAPSED_HOURS",
                task_defaults.no_response_min_elapsed,
            )?,
        };

        let mail = MailConfig {
            api_url: std::env::var("MAIL_API_URL").unwrap_or(mail_defaults.api_url),
            api_key: std::env::var("MAIL_API_KEY")
                .ok()
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
            from: std::env::var("MAIL_FROM").unwrap_or(mail_defaults.from),
        };

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            timing_profile: parsed_var("TIMING_PROFILE", TimingProfile::default())?,
            queue,
            scanner,
            tasks,
            mail,
            operation_timeout: secs_var("OPERATION_TIMEOUT_SECS", Duration::from_secs(15))?,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid value for {name} ({raw}): {e}"))),
        Err(_) => Ok(default),
    }
}

fn hours_var(name: &str, default: chrono::Duration) -> Result<chrono::Duration> {
    let hours = parsed_var(name, default.num_hours())?;
    chrono::Duration::try_hours(hours)
        .ok_or_else(|| Error::Config(format!("{name} ({hours}) is out of range")))
}

fn secs_var(name: &str, default: Duration) -> Result<Duration> {
    parsed_var(name, default.as_secs()).map(Duration::from_secs)
}
