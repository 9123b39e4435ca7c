//! Service configuration.
//!
//! Values come from an optional TOML file, then from `MARKUP_*` environment
//! variables (after loading `.env` if present). Environment wins.

use markup_log::debug;
use markup_queue::{QueueConfig, RetentionPolicy, WorkerConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ConfigError, Result};

/// Prefix of the environment variables the service reads.
pub const ENV_PREFIX: &str = "MARKUP";

/// Longest debounce or retry delay accepted (one year).
pub const MAX_DELAY_MS: u64 = 365 * 24 * 3600 * 1000;

/// Longest retention age accepted (ten years).
pub const MAX_RETENTION_SECS: u64 = 10 * 365 * 24 * 3600;

/// Environment variable loader
pub struct EnvLoader {
    prefix: Option<String>,
}

impl EnvLoader {
    /// Create a new environment loader
    pub fn new(prefix: Option<String>) -> Self {
        Self { prefix }
    }

    /// Load the process environment, keyed by lowercase name without prefix.
    pub fn load(&self) -> HashMap<String, String> {
        self.collect(std::env::vars())
    }

    /// Same as [`EnvLoader::load`], over an arbitrary set of variables.
    pub fn collect<I>(&self, vars: I) -> HashMap<String, String>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = HashMap::new();
        for (key, value) in vars {
            match &self.prefix {
                Some(prefix) => {
                    if let Some(rest) = key.strip_prefix(prefix.as_str())
                        && let Some(rest) = rest.strip_prefix('_')
                    {
                        config.insert(rest.to_lowercase(), value);
                    }
                }
                None => {
                    config.insert(key.to_lowercase(), value);
                }
            }
        }
        config
    }
}

impl Default for EnvLoader {
    fn default() -> Self {
        Self::new(Some(ENV_PREFIX.to_string()))
    }
}

/// Everything the service binary needs to start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// HTTP listen address
    pub bind: String,

    /// Redis URL; the in-memory store is used when absent
    pub redis_url: Option<String>,

    pub queue_name: String,
    pub debounce_delay_ms: u64,
    pub retry_delay_ms: u64,
    pub max_attempts: u32,
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub housekeeping_interval_secs: u64,

    /// Completed jobs older than this are removed
    pub completed_retention_secs: u64,
    /// At most this many completed jobs are kept
    pub completed_retention_count: usize,
    /// Failed jobs older than this are removed
    pub failed_retention_secs: u64,
    /// At most this many failed jobs are kept
    pub failed_retention_count: usize,

    /// Shell command run once per job
    pub handler_command: Option<String>,

    /// Kill the handler command after this many seconds
    pub handler_timeout_secs: Option<u64>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let queue = QueueConfig::default();
        let worker = WorkerConfig::default();
        Self {
            bind: "127.0.0.1:8080".to_string(),
            redis_url: None,
            queue_name: queue.queue_name,
            debounce_delay_ms: queue.debounce_delay.as_millis() as u64,
            retry_delay_ms: queue.retry_delay.as_millis() as u64,
            max_attempts: queue.max_attempts,
            concurrency: worker.concurrency,
            poll_interval_ms: worker.poll_interval.as_millis() as u64,
            housekeeping_interval_secs: 300,
            completed_retention_secs: queue.completed_retention.max_age.as_secs(),
            completed_retention_count: queue.completed_retention.max_count,
            failed_retention_secs: queue.failed_retention.max_age.as_secs(),
            failed_retention_count: queue.failed_retention.max_count,
            handler_command: None,
            handler_timeout_secs: None,
        }
    }
}

impl ServiceConfig {
    /// Load from `.env`, an optional TOML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(file) => debug!(path = %file.display(), "Loaded .env"),
            Err(e) if e.not_found() => {}
            Err(e) => return Err(ConfigError::LoadError(format!(".env: {e}"))),
        }

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(&EnvLoader::default().load())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            ConfigError::LoadError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ConfigError::ParseError(format!("TOML parse error: {}", e)))
    }

    /// Override fields from prefix-stripped, lowercase environment variables.
    ///
    /// Unrelated keys are ignored; empty values unset optional fields.
    pub fn apply_env(&mut self, vars: &HashMap<String, String>) -> Result<()> {
        for (key, value) in vars {
            let value = value.trim();
            match key.as_str() {
                "bind" => self.bind = value.to_string(),
                "redis_url" => self.redis_url = optional(value),
                "queue_name" => self.queue_name = value.to_string(),
                "debounce_delay_ms" => self.debounce_delay_ms = parse(key, value)?,
                "retry_delay_ms" => self.retry_delay_ms = parse(key, value)?,
                "max_attempts" => self.max_attempts = parse(key, value)?,
                "concurrency" => self.concurrency = parse(key, value)?,
                "poll_interval_ms" => self.poll_interval_ms = parse(key, value)?,
                "housekeeping_interval_secs" => {
                    self.housekeeping_interval_secs = parse(key, value)?
                }
                "completed_retention_secs" => {
                    self.completed_retention_secs = parse(key, value)?
                }
                "completed_retention_count" => {
                    self.completed_retention_count = parse(key, value)?
                }
                "failed_retention_secs" => self.failed_retention_secs = parse(key, value)?,
                "failed_retention_count" => self.failed_retention_count = parse(key, value)?,
                "handler_command" => self.handler_command = optional(value),
                "handler_timeout_secs" => {
                    self.handler_timeout_secs = match optional(value) {
                        Some(v) => Some(parse(key, &v)?),
                        None => None,
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Reject values the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.bind_addr()?;
        if self.queue_name.trim().is_empty() {
            return Err(invalid("queue_name must not be empty"));
        }
        for (name, ms) in [
            ("debounce_delay_ms", self.debounce_delay_ms),
            ("retry_delay_ms", self.retry_delay_ms),
        ] {
            if ms > MAX_DELAY_MS {
                return Err(invalid(&format!("{name} must be at most {MAX_DELAY_MS}")));
            }
        }
        for (name, secs) in [
            ("completed_retention_secs", self.completed_retention_secs),
            ("failed_retention_secs", self.failed_retention_secs),
        ] {
            if secs > MAX_RETENTION_SECS {
                return Err(invalid(&format!("{name} must be at most {MAX_RETENTION_SECS}")));
            }
        }
        if self.max_attempts == 0 {
            return Err(invalid("max_attempts must be at least 1"));
        }
        if self.concurrency == 0 {
            return Err(invalid("concurrency must be at least 1"));
        }
        if self.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms must be positive"));
        }
        if self.housekeeping_interval_secs == 0 {
            return Err(invalid("housekeeping_interval_secs must be positive"));
        }
        if self.handler_timeout_secs == Some(0) {
            return Err(invalid("handler_timeout_secs must be positive"));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind
            .parse()
            .map_err(|e| invalid(&format!("bind address {:?}: {}", self.bind, e)))
    }

    /// The handler command, which the service cannot run without.
    pub fn handler_command(&self) -> Result<&str> {
        self.handler_command
            .as_deref()
            .ok_or_else(|| ConfigError::KeyNotFound(format!("{ENV_PREFIX}_HANDLER_COMMAND")))
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_secs.map(Duration::from_secs)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_secs(self.housekeeping_interval_secs)
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::new(self.queue_name.clone())
            .with_debounce_delay(Duration::from_millis(self.debounce_delay_ms))
            .with_retry_delay(Duration::from_millis(self.retry_delay_ms))
            .with_max_attempts(self.max_attempts)
            .with_completed_retention(RetentionPolicy::new(
                Duration::from_secs(self.completed_retention_secs),
                self.completed_retention_count,
            ))
            .with_failed_retention(RetentionPolicy::new(
                Duration::from_secs(self.failed_retention_secs),
                self.failed_retention_count,
            ))
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_concurrency(self.concurrency)
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
    }
}

fn optional(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e| {
        ConfigError::ParseError(format!(
            "{ENV_PREFIX}_{}={:?}: {}",
            key.to_uppercase(),
            value,
            e
        ))
    })
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::ValidationError(message.to_string())
}
