//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast on malformed values. Every section has
//! a usable `Default` so library users can also build it in code. The
//! transport connection string is wrapped in `SecretString` to keep it out
//! of logs.

use crate::error::{Error, Result};
use secrecy::SecretString;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    pub connection: Option<SecretString>,
    pub worker: WorkerConfig,
    pub scheduler: SchedulerConfig,
    pub heartbeat: HeartBeatConfig,
    pub queue_wait: QueueWaitConfig,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let worker_defaults = WorkerConfig::default();
        let worker = WorkerConfig {
            worker_count: parse_var("WORKQ_WORKERS", worker_defaults.worker_count)?,
            stop_timeout: millis_var("WORKQ_STOP_TIMEOUT_MS", worker_defaults.stop_timeout)?,
            cancel_timeout: millis_var("WORKQ_CANCEL_TIMEOUT_MS", worker_defaults.cancel_timeout)?,
            abort_workers_on_stop_timeout: parse_var(
                "WORKQ_ABORT_ON_STOP_TIMEOUT",
                worker_defaults.abort_workers_on_stop_timeout,
            )?,
            single_poller_when_idle: parse_var(
                "WORKQ_SINGLE_POLLER_WHEN_IDLE",
                worker_defaults.single_poller_when_idle,
            )?,
            gate_wait: millis_var("WORKQ_GATE_WAIT_MS", worker_defaults.gate_wait)?,
        };

        let scheduler_defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            max_threads: parse_var("WORKQ_SCHEDULER_MAX_THREADS", scheduler_defaults.max_threads)?,
            shutdown_timeout: millis_var(
                "WORKQ_SCHEDULER_SHUTDOWN_MS",
                scheduler_defaults.shutdown_timeout,
            )?,
        };

        let heartbeat_defaults = HeartBeatConfig::default();
        let heartbeat = HeartBeatConfig {
            enabled: parse_var("WORKQ_HEARTBEAT_ENABLED", heartbeat_defaults.enabled)?,
            window: Duration::from_secs(parse_var(
                "WORKQ_HEARTBEAT_WINDOW_SECS",
                heartbeat_defaults.window.as_secs(),
            )?),
            schedule: std::env::var("WORKQ_HEARTBEAT_SCHEDULE")
                .unwrap_or(heartbeat_defaults.schedule),
            threads: parse_var("WORKQ_HEARTBEAT_THREADS", heartbeat_defaults.threads)?,
            reset_limit: parse_var("WORKQ_HEARTBEAT_RESET_LIMIT", heartbeat_defaults.reset_limit)?,
        };

        let queue_wait = match std::env::var("WORKQ_POLL_BACKOFF_MS") {
            Ok(raw) => QueueWaitConfig::parse_backoff(&raw)?,
            Err(_) => QueueWaitConfig::default(),
        };

        let config = Self {
            connection: std::env::var("WORKQ_CONNECTION").ok().map(SecretString::from),
            worker,
            scheduler,
            heartbeat,
            queue_wait,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.worker.validate()?;
        self.scheduler.validate()?;
        self.heartbeat.validate()?;
        self.queue_wait.validate()
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Worker collection settings. Read-only once the collection starts.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of worker loops.
    pub worker_count: usize,
    /// How long `stop` waits for loops and in-flight messages to finish.
    pub stop_timeout: Duration,
    /// How long `stop` waits after cancelling in-flight messages.
    pub cancel_timeout: Duration,
    /// Abort loops that outlive both grace windows. Unsafe: the message they
    /// hold stays claimed until a heartbeat reset recovers it.
    pub abort_workers_on_stop_timeout: bool,
    /// Only one worker polls an empty queue; the rest wait for it to find work.
    pub single_poller_when_idle: bool,
    /// Upper bound on one wait on the backpressure gate before re-checking room.
    pub gate_wait: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            stop_timeout: Duration::from_secs(5),
            cancel_timeout: Duration::from_secs(10),
            abort_workers_on_stop_timeout: false,
            single_poller_when_idle: false,
            gate_wait: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(Error::Config("worker count must be at least 1".to_string()));
        }
        if self.gate_wait.is_zero() {
            return Err(Error::Config("gate wait must be greater than zero".to_string()));
        }
        Ok(())
    }
}

/// Task scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Dispatch pool size and the cap on running tasks, grouped or not.
    pub max_threads: usize,
    /// How long `dispose` waits for running work.
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_threads: std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_threads == 0 {
            return Err(Error::Config("scheduler max threads must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Heartbeat subsystem settings.
#[derive(Debug, Clone)]
pub struct HeartBeatConfig {
    pub enabled: bool,
    /// A message whose last heartbeat is older than this is considered dead.
    pub window: Duration,
    /// Cron expression (seconds field first) driving updates.
    pub schedule: String,
    /// Size of the dedicated heartbeat pool.
    pub threads: usize,
    /// Maximum messages reset per scan.
    pub reset_limit: usize,
}

impl Default for HeartBeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(600),
            schedule: "*/30 * * * * *".to_string(),
            threads: 1,
            reset_limit: 500,
        }
    }
}

impl HeartBeatConfig {
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(Error::Config("heartbeat threads must be at least 1".to_string()));
        }
        if self.window.is_zero() {
            return Err(Error::Config("heartbeat window must be greater than zero".to_string()));
        }
        if self.reset_limit == 0 {
            return Err(Error::Config("heartbeat reset limit must be at least 1".to_string()));
        }
        crate::heartbeat::HeartBeatSchedule::from_str(&self.schedule)?;
        Ok(())
    }
}

/// Back-off between empty dequeues.
#[derive(Debug, Clone)]
pub struct QueueWaitConfig {
    /// Successive sleeps; the last one repeats.
    pub backoff: Vec<Duration>,
}

impl Default for QueueWaitConfig {
    fn default() -> Self {
        Self {
            backoff: vec![
                Duration::from_millis(100),
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_secs(1),
            ],
        }
    }
}

impl QueueWaitConfig {
    /// Parse a comma-separated list of milliseconds, e.g. `"100,250,1000"`.
    pub fn parse_backoff(raw: &str) -> Result<Self> {
        let backoff = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|e| Error::Config(format!("invalid poll back-off {s:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let config = Self { backoff };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backoff.is_empty() {
            return Err(Error::Config("poll back-off needs at least one step".to_string()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid value for {name}: {e}"))),
        Err(_) => Ok(default),
    }
}

fn millis_var(name: &str, default: Duration) -> Result<Duration> {
    parse_var(name, default.as_millis() as u64).map(Duration::from_millis)
}
