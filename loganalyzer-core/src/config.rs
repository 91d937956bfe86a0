//! Environment configuration
//!
//! Both binaries read their settings from environment variables on top of
//! the `Default` values, then validate them before anything starts.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::coordinator::CoordinatorConfig;
use crate::error::{AnalyzerError, Result};
use crate::worker::WorkerConfig;

/// Environment variable names
pub mod keys {
    pub const LOG_FILE: &str = "LOG_FILE";
    pub const BIND_ADDR: &str = "BIND_ADDR";
    pub const CHUNK_SIZE_BYTES: &str = "CHUNK_SIZE_BYTES";
    pub const HEALTH_CHECK_INTERVAL_SECS: &str = "HEALTH_CHECK_INTERVAL_SECS";
    pub const SUSPECT_AFTER_SECS: &str = "SUSPECT_AFTER_SECS";
    pub const DEAD_AFTER_SECS: &str = "DEAD_AFTER_SECS";
    pub const PROCESSING_TIMEOUT_SECS: &str = "PROCESSING_TIMEOUT_SECS";
    pub const RECLAIM_INTERVAL_SECS: &str = "RECLAIM_INTERVAL_SECS";
    pub const RETRY_LIMIT: &str = "RETRY_LIMIT";

    pub const COORDINATOR_URL: &str = "COORDINATOR_URL";
    pub const WORKER_ID: &str = "WORKER_ID";
    pub const WORKER_BIND_ADDR: &str = "WORKER_BIND_ADDR";
    pub const WORKER_ADVERTISE_URL: &str = "WORKER_ADVERTISE_URL";
    pub const HEARTBEAT_INTERVAL_SECS: &str = "HEARTBEAT_INTERVAL_SECS";
    pub const POLL_INTERVAL_MS: &str = "POLL_INTERVAL_MS";
}

/// Source of configuration values, `None` when a key is unset
type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn non_empty(source: Lookup<'_>, key: &str) -> Option<String> {
    source(key).filter(|v| !v.trim().is_empty())
}

fn parsed<T>(source: Lookup<'_>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    let Some(raw) = non_empty(source, key) else {
        return Ok(None);
    };
    raw.trim().parse().map(Some).map_err(|e: T::Err| AnalyzerError::Config {
        key: key.to_string(),
        reason: format!("cannot parse {:?}: {}", raw, e),
    })
}

fn secs(source: Lookup<'_>, key: &str, default: Duration) -> Result<Duration> {
    Ok(parsed::<u64>(source, key)?.map_or(default, Duration::from_secs))
}

fn millis(source: Lookup<'_>, key: &str, default: Duration) -> Result<Duration> {
    Ok(parsed::<u64>(source, key)?.map_or(default, Duration::from_millis))
}

fn require_nonzero(key: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(AnalyzerError::Config {
            key: key.to_string(),
            reason: "must be greater than zero".into(),
        });
    }
    Ok(())
}

impl CoordinatorConfig {
    /// Defaults overridden by the process environment
    pub fn from_env() -> Result<Self> {
        Self::load(&env_lookup)
    }

    /// Defaults overridden by `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::load(&lookup)
    }

    fn load(source: Lookup<'_>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = parsed::<PathBuf>(source, keys::LOG_FILE)? {
            config.log_file = path;
        }
        if let Some(addr) = non_empty(source, keys::BIND_ADDR) {
            config.bind_addr = addr;
        }
        if let Some(size) = parsed(source, keys::CHUNK_SIZE_BYTES)? {
            config.chunk_size = size;
        }

        config.health.check_interval =
            secs(source, keys::HEALTH_CHECK_INTERVAL_SECS, config.health.check_interval)?;
        config.health.suspect_after = secs(source, keys::SUSPECT_AFTER_SECS, config.health.suspect_after)?;
        config.health.dead_after = secs(source, keys::DEAD_AFTER_SECS, config.health.dead_after)?;
        config.dispatcher.processing_timeout =
            secs(source, keys::PROCESSING_TIMEOUT_SECS, config.dispatcher.processing_timeout)?;
        config.reclaim_interval = secs(source, keys::RECLAIM_INTERVAL_SECS, config.reclaim_interval)?;
        if let Some(limit) = parsed(source, keys::RETRY_LIMIT)? {
            config.dispatcher.retry_limit = limit;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the coordinator cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(AnalyzerError::Config {
                key: keys::CHUNK_SIZE_BYTES.into(),
                reason: "must be greater than zero".into(),
            });
        }
        if self.dispatcher.retry_limit == 0 {
            return Err(AnalyzerError::Config {
                key: keys::RETRY_LIMIT.into(),
                reason: "must allow at least one attempt".into(),
            });
        }

        require_nonzero(keys::HEALTH_CHECK_INTERVAL_SECS, self.health.check_interval)?;
        require_nonzero(keys::SUSPECT_AFTER_SECS, self.health.suspect_after)?;
        require_nonzero(keys::PROCESSING_TIMEOUT_SECS, self.dispatcher.processing_timeout)?;
        require_nonzero(keys::RECLAIM_INTERVAL_SECS, self.reclaim_interval)?;

        if self.health.dead_after <= self.health.suspect_after {
            return Err(AnalyzerError::Config {
                key: keys::DEAD_AFTER_SECS.into(),
                reason: format!(
                    "dead threshold {:?} must exceed suspect threshold {:?}",
                    self.health.dead_after, self.health.suspect_after
                ),
            });
        }
        Ok(())
    }
}

impl WorkerConfig {
    /// Defaults overridden by the process environment
    pub fn from_env() -> Result<Self> {
        Self::load(&env_lookup)
    }

    /// Defaults overridden by `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::load(&lookup)
    }

    fn load(source: Lookup<'_>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(url) = non_empty(source, keys::COORDINATOR_URL) {
            config.coordinator_url = url;
        }
        if let Some(id) = non_empty(source, keys::WORKER_ID) {
            config.worker_id = id;
        }
        if let Some(addr) = non_empty(source, keys::WORKER_BIND_ADDR) {
            config.bind_addr = addr;
        }
        config.advertise_url = non_empty(source, keys::WORKER_ADVERTISE_URL);
        config.heartbeat_interval = secs(source, keys::HEARTBEAT_INTERVAL_SECS, config.heartbeat_interval)?;
        config.poll_interval = millis(source, keys::POLL_INTERVAL_MS, config.poll_interval)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.coordinator_url.starts_with("http://") && !self.coordinator_url.starts_with("https://") {
            return Err(AnalyzerError::Config {
                key: keys::COORDINATOR_URL.into(),
                reason: format!("{:?} is not an http(s) URL", self.coordinator_url),
            });
        }
        require_nonzero(keys::HEARTBEAT_INTERVAL_SECS, self.heartbeat_interval)?;
        require_nonzero(keys::POLL_INTERVAL_MS, self.poll_interval)?;
        Ok(())
    }
}
