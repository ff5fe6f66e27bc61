//! Controller settings

use crate::error::{ReplicaSetError, Result};
use crate::retry::AttemptStrategy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Prefix for environment overrides, e.g. `REPLSET_STEP_DOWN_SECS=30`
pub const ENV_PREFIX: &str = "REPLSET";

/// Timing and retry settings for the replica set controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaSetSettings {
    /// How many times to send the initiate command while members are unreachable
    pub initiate_attempts: usize,

    /// Delay between initiate command attempts
    pub initiate_attempt_delay_ms: u64,

    /// How many status polls to make while waiting for initiate to settle
    pub initiate_status_attempts: usize,

    /// Delay between status polls after initiate
    pub initiate_status_delay_ms: u64,

    /// Interval between readiness checks in `wait_until_ready`
    pub ready_poll_interval_ms: u64,

    /// Minimum time a stepped-down primary stays ineligible
    pub step_down_secs: u64,

    /// Total budget for caller-side reconfiguration retries
    pub reconfig_retry_total_ms: u64,

    /// Delay between caller-side reconfiguration retries
    pub reconfig_retry_delay_ms: u64,
}

impl Default for ReplicaSetSettings {
    fn default() -> Self {
        Self {
            initiate_attempts: 10,
            initiate_attempt_delay_ms: 100,
            initiate_status_attempts: 50,
            initiate_status_delay_ms: 500,
            ready_poll_interval_ms: 1000,
            step_down_secs: 60,
            // Primary renegotiation after a reconfig typically takes 10-20s
            // but can take over a minute.
            reconfig_retry_total_ms: 120_000,
            reconfig_retry_delay_ms: 500,
        }
    }
}

impl ReplicaSetSettings {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ReplicaSetError::configuration(format!("Failed to read settings file: {}", e))
        })?;

        toml::from_str(&content)
            .map_err(|e| ReplicaSetError::configuration(format!("Failed to parse settings: {}", e)))
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            ReplicaSetError::configuration(format!("Failed to serialize settings: {}", e))
        })?;

        std::fs::write(path, content).map_err(|e| {
            ReplicaSetError::configuration(format!("Failed to write settings file: {}", e))
        })?;

        Ok(())
    }

    /// Layer defaults, an optional file and `REPLSET_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&Self::default())
            .map_err(|e| ReplicaSetError::configuration(e.to_string()))?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        let settings: Self = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ReplicaSetError::configuration(format!("Failed to load settings: {}", e)))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings
    pub fn validate(&self) -> Result<()> {
        if self.initiate_attempts == 0 {
            return Err(ReplicaSetError::configuration(
                "initiate_attempts must be at least 1",
            ));
        }

        if self.initiate_status_attempts == 0 {
            return Err(ReplicaSetError::configuration(
                "initiate_status_attempts must be at least 1",
            ));
        }

        if self.ready_poll_interval_ms == 0 {
            return Err(ReplicaSetError::configuration(
                "ready_poll_interval_ms must be greater than zero",
            ));
        }

        Ok(())
    }

    pub fn initiate_strategy(&self) -> AttemptStrategy {
        AttemptStrategy::attempts(
            self.initiate_attempts,
            Duration::from_millis(self.initiate_attempt_delay_ms),
        )
    }

    pub fn initiate_status_strategy(&self) -> AttemptStrategy {
        AttemptStrategy::attempts(
            self.initiate_status_attempts,
            Duration::from_millis(self.initiate_status_delay_ms),
        )
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    /// Strategy callers should wrap `add`, `remove` and `set` in
    pub fn reconfig_strategy(&self) -> AttemptStrategy {
        AttemptStrategy::new(
            Duration::from_millis(self.reconfig_retry_total_ms),
            Duration::from_millis(self.reconfig_retry_delay_ms),
        )
    }
}
