use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::orchestration::{
    CascadePolicy, ResourceProfile, RetryPolicy, RunConfig, DEFAULT_BASE_DELAY_MS,
    DEFAULT_CANCEL_GRACE_MS, DEFAULT_MAX_DELAY_MS, DEFAULT_MAX_RETRIES, DEFAULT_MAX_WORKERS,
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_TASK_TIMEOUT_SECS, DEFAULT_TIME_UNIT_MS,
};
use crate::core::Resources;
use crate::{Error, Result};

/// User configuration, read from `~/.strata/strata.toml`.
///
/// Every field is optional in the file; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_workers: usize,
    pub per_worker_capacity: Resources,
    pub cascade: CascadePolicy,
    pub allow_partial_plans: bool,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub task_timeout_secs: u64,
    pub cancel_grace_ms: u64,
    pub poll_interval_ms: u64,
    /// Wall-clock milliseconds per estimate unit.
    pub time_unit_ms: u64,
    pub prioritize_critical_path: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            per_worker_capacity: Resources::new(),
            cascade: CascadePolicy::default(),
            allow_partial_plans: false,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_BASE_DELAY_MS,
            retry_max_delay_ms: DEFAULT_MAX_DELAY_MS,
            task_timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            cancel_grace_ms: DEFAULT_CANCEL_GRACE_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            time_unit_ms: DEFAULT_TIME_UNIT_MS,
            prioritize_critical_path: false,
        }
    }
}

impl Config {
    pub fn strata_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".strata"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::strata_dir()?.join("strata.toml"))
    }

    /// Load from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `path`, falling back to defaults when it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.resource_profile().validate()?;
        debug!(
            max_workers = config.max_workers,
            cascade = ?config.cascade,
            "config loaded"
        );
        Ok(config)
    }

    /// Save to the default location, creating `~/.strata` if needed.
    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::config_path()?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                debug!(dir = %parent.display(), "creating config directory");
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn resource_profile(&self) -> ResourceProfile {
        ResourceProfile {
            max_workers: self.max_workers,
            per_worker_capacity: self.per_worker_capacity.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay_ms: self.retry_base_delay_ms,
            max_delay_ms: self.retry_max_delay_ms,
        }
    }

    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            profile: self.resource_profile(),
            retry: self.retry_policy(),
            cascade: self.cascade,
            allow_partial_plans: self.allow_partial_plans,
            task_timeout: Duration::from_secs(self.task_timeout_secs),
            cancel_grace: Duration::from_millis(self.cancel_grace_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            time_unit: Duration::from_millis(self.time_unit_ms),
            prioritize_critical_path: self.prioritize_critical_path,
        }
    }
}
