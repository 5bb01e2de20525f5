//! Runtime configuration, loaded from defaults or environment variables.

use std::time::Duration;

/// Configuration for a [`crate::FlowRuntime`] and its schedules
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Lease owner name used when claiming traces
    pub worker_id: String,
    /// Applications whose traces this worker recovers; empty means all
    pub applications: Vec<String>,
    pub recovery_interval: Duration,
    pub retry_interval: Duration,
    pub retry_batch_limit: usize,
    /// Ownership lease length, renewed on every recovery tick
    pub ownership_ttl: Duration,
    pub cleanup_interval: Duration,
    pub expired_days: u32,
    pub cleanup_batch_limit: usize,
    /// Initial and replenished demand of every node input
    pub input_demand: usize,
    /// Concurrent Jober invocations per State node
    pub max_concurrent_tasks: usize,
    pub event_buffer_size: usize,
    /// How often node workers drop in-memory buffers of closed traces
    pub buffer_sweep_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            applications: Vec::new(),
            recovery_interval: Duration::from_millis(10_000),
            retry_interval: Duration::from_millis(1_000),
            retry_batch_limit: 100,
            ownership_ttl: Duration::from_millis(30_000),
            cleanup_interval: Duration::from_secs(3600),
            expired_days: 7,
            cleanup_batch_limit: 100,
            input_demand: 64,
            max_concurrent_tasks: 16,
            event_buffer_size: 1000,
            buffer_sweep_interval: Duration::from_millis(5_000),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from environment variables.
    ///
    /// All optional, defaults as in [`RuntimeConfig::default`]:
    /// - `FLOW_WORKER_ID`
    /// - `FLOW_APPLICATIONS`: comma separated list
    /// - `FLOW_RECOVERY_INTERVAL_MS`, `FLOW_RETRY_INTERVAL_MS`, `FLOW_OWNERSHIP_TTL_MS`
    /// - `FLOW_BUFFER_SWEEP_INTERVAL_MS`
    /// - `FLOW_EXPIRED_DAYS`
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(worker_id) = std::env::var("FLOW_WORKER_ID") {
            if worker_id.trim().is_empty() {
                return Err(ConfigError::Invalid("FLOW_WORKER_ID", "must not be empty"));
            }
            config.worker_id = worker_id;
        }

        if let Ok(applications) = std::env::var("FLOW_APPLICATIONS") {
            config.applications = applications
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(ms) = parse_var::<u64>("FLOW_RECOVERY_INTERVAL_MS")? {
            config.recovery_interval = positive_millis("FLOW_RECOVERY_INTERVAL_MS", ms)?;
        }
        if let Some(ms) = parse_var::<u64>("FLOW_RETRY_INTERVAL_MS")? {
            config.retry_interval = positive_millis("FLOW_RETRY_INTERVAL_MS", ms)?;
        }
        if let Some(ms) = parse_var::<u64>("FLOW_OWNERSHIP_TTL_MS")? {
            config.ownership_ttl = positive_millis("FLOW_OWNERSHIP_TTL_MS", ms)?;
        }
        if let Some(ms) = parse_var::<u64>("FLOW_BUFFER_SWEEP_INTERVAL_MS")? {
            config.buffer_sweep_interval = positive_millis("FLOW_BUFFER_SWEEP_INTERVAL_MS", ms)?;
        }
        if let Some(days) = parse_var::<u32>("FLOW_EXPIRED_DAYS")? {
            config.expired_days = days;
        }

        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(key, "must be a non-negative integer")),
        Err(_) => Ok(None),
    }
}

fn positive_millis(key: &'static str, ms: u64) -> Result<Duration, ConfigError> {
    if ms == 0 {
        return Err(ConfigError::Invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_millis(ms))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
