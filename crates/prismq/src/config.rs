//! Queue configuration: file loading and environment overrides.
//!
//! Configuration may come from a JSON, YAML or TOML file (chosen by
//! extension). Environment variables with the `PRISMQ_` prefix override file
//! values; a typed override that fails to parse logs a warning and keeps the
//! file value.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;
use crate::model::SchedulingStrategy;
use crate::retry::RetryConfig;

/// Default environment variable prefix.
pub const ENV_PREFIX: &str = "PRISMQ_";

/// Full configuration surface for a queue instance and its workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Location of the database file. `None` means the platform default.
    pub db_path: Option<PathBuf>,
    /// Worker identity. `None` means generate `worker-<uuid>` at startup.
    pub worker_id: Option<String>,
    /// Worker capabilities document.
    pub capabilities: Value,
    pub scheduling_strategy: SchedulingStrategy,
    /// Claim lease length in seconds.
    pub lease_duration_seconds: i64,
    /// Idle-worker sleep between empty claims.
    pub poll_interval_seconds: f64,
    /// Default retry budget for new tasks.
    pub max_attempts: i64,
    /// Heartbeat age after which a worker counts as stale.
    pub stale_threshold_seconds: i64,
    /// Heartbeat age within which a worker counts as active.
    pub active_threshold_seconds: i64,
    /// Advisory cap on concurrent workers per process.
    pub max_concurrent_workers: usize,
    pub retry: RetryConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            worker_id: None,
            capabilities: Value::Object(serde_json::Map::new()),
            scheduling_strategy: SchedulingStrategy::Priority,
            lease_duration_seconds: 60,
            poll_interval_seconds: 1.0,
            max_attempts: 5,
            stale_threshold_seconds: 300,
            active_threshold_seconds: 60,
            max_concurrent_workers: 16,
            retry: RetryConfig::default(),
        }
    }
}

impl QueueConfig {
    /// Load from a file and apply `PRISMQ_` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides(ENV_PREFIX);
        Ok(config)
    }

    /// Load from a JSON/YAML/TOML file, chosen by extension. No environment
    /// overrides are applied.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();

        if !path.exists() {
            return Err(ConfigError::NotFound { path: display });
        }

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;

        match extension.as_str() {
            "json" => serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
                path: display,
                message: e.to_string(),
            }),
            "yaml" | "yml" => serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse {
                path: display,
                message: e.to_string(),
            }),
            "toml" => toml::from_str(&raw).map_err(|e| ConfigError::Parse {
                path: display,
                message: e.to_string(),
            }),
            other => Err(ConfigError::UnsupportedFormat {
                extension: other.to_string(),
            }),
        }
    }

    /// Apply environment overrides with the given prefix.
    ///
    /// Integer, float and JSON overrides that fail to parse are ignored with
    /// a warning; the previous value stays in effect.
    pub fn apply_env_overrides(&mut self, prefix: &str) {
        if let Some(value) = env_var(prefix, "DB_PATH") {
            self.db_path = Some(PathBuf::from(value));
        }
        if let Some(value) = env_var(prefix, "WORKER_ID") {
            self.worker_id = Some(value);
        }
        if let Some(value) = env_var(prefix, "SCHEDULING_STRATEGY") {
            match value.parse::<SchedulingStrategy>() {
                Ok(strategy) => self.scheduling_strategy = strategy,
                Err(e) => warn_override(prefix, "SCHEDULING_STRATEGY", &value, &e.to_string()),
            }
        }
        if let Some(value) = env_var(prefix, "CAPABILITIES") {
            match serde_json::from_str::<Value>(&value) {
                Ok(capabilities) => self.capabilities = capabilities,
                Err(e) => warn_override(prefix, "CAPABILITIES", &value, &e.to_string()),
            }
        }

        override_i64(prefix, "LEASE_DURATION_SECONDS", &mut self.lease_duration_seconds);
        override_i64(prefix, "MAX_ATTEMPTS", &mut self.max_attempts);
        override_i64(prefix, "STALE_THRESHOLD_SECONDS", &mut self.stale_threshold_seconds);
        override_i64(prefix, "ACTIVE_THRESHOLD_SECONDS", &mut self.active_threshold_seconds);
        override_usize(prefix, "MAX_CONCURRENT_WORKERS", &mut self.max_concurrent_workers);
        override_f64(prefix, "POLL_INTERVAL_SECONDS", &mut self.poll_interval_seconds);
        override_f64(
            prefix,
            "RETRY_INITIAL_DELAY_SECONDS",
            &mut self.retry.initial_delay_seconds,
        );
        override_f64(
            prefix,
            "RETRY_MAX_DELAY_SECONDS",
            &mut self.retry.max_delay_seconds,
        );
        override_f64(
            prefix,
            "RETRY_BACKOFF_MULTIPLIER",
            &mut self.retry.backoff_multiplier,
        );
        override_f64(prefix, "RETRY_JITTER_FACTOR", &mut self.retry.jitter_factor);
    }

    /// The configured database path, or the platform default.
    pub fn resolved_db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(default_db_path)
    }

    /// The configured worker id, or a generated `worker-<uuid>`.
    pub fn resolved_worker_id(&self) -> String {
        self.worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()))
    }
}

/// Platform default location for the queue database.
pub fn default_db_path() -> PathBuf {
    #[cfg(windows)]
    {
        let base = std::env::var("PROGRAMDATA").unwrap_or_else(|_| r"C:\ProgramData".to_string());
        PathBuf::from(base).join("PrismQ").join("queue").join("queue.db")
    }
    #[cfg(not(windows))]
    {
        PathBuf::from("/var/lib/prismq/queue.db")
    }
}

fn env_var(prefix: &str, name: &str) -> Option<String> {
    std::env::var(format!("{prefix}{name}")).ok()
}

fn warn_override(prefix: &str, name: &str, value: &str, error: &str) {
    tracing::warn!(
        variable = format!("{prefix}{name}"),
        value,
        error,
        "ignoring unparsable environment override"
    );
}

fn override_i64(prefix: &str, name: &str, slot: &mut i64) {
    if let Some(value) = env_var(prefix, name) {
        match value.parse::<i64>() {
            Ok(parsed) => *slot = parsed,
            Err(e) => warn_override(prefix, name, &value, &e.to_string()),
        }
    }
}

fn override_usize(prefix: &str, name: &str, slot: &mut usize) {
    if let Some(value) = env_var(prefix, name) {
        match value.parse::<usize>() {
            Ok(parsed) => *slot = parsed,
            Err(e) => warn_override(prefix, name, &value, &e.to_string()),
        }
    }
}

fn override_f64(prefix: &str, name: &str, slot: &mut f64) {
    if let Some(value) = env_var(prefix, name) {
        match value.parse::<f64>() {
            Ok(parsed) => *slot = parsed,
            Err(e) => warn_override(prefix, name, &value, &e.to_string()),
        }
    }
}
