//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

use offsync_common::{Error, Priority, Result};

use crate::integrity::RepairStrategy;
use crate::policy::{default_policies, SyncPolicy};
use crate::queue::QueueConfig;
use crate::retry::RetryConfig;

/// Per-tier queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfigs {
    pub critical: QueueConfig,
    pub high: QueueConfig,
    pub medium: QueueConfig,
    pub low: QueueConfig,
}

impl QueueConfigs {
    pub fn get(&self, tier: Priority) -> &QueueConfig {
        match tier {
            Priority::Critical => &self.critical,
            Priority::High => &self.high,
            Priority::Medium => &self.medium,
            Priority::Low => &self.low,
        }
    }

    pub fn get_mut(&mut self, tier: Priority) -> &mut QueueConfig {
        match tier {
            Priority::Critical => &mut self.critical,
            Priority::High => &mut self.high,
            Priority::Medium => &mut self.medium,
            Priority::Low => &mut self.low,
        }
    }

    pub fn to_array(&self) -> [QueueConfig; 4] {
        [
            self.critical.clone(),
            self.high.clone(),
            self.medium.clone(),
            self.low.clone(),
        ]
    }
}

impl Default for QueueConfigs {
    fn default() -> Self {
        Self {
            critical: QueueConfig::default_for(Priority::Critical),
            high: QueueConfig::default_for(Priority::High),
            medium: QueueConfig::default_for(Priority::Medium),
            low: QueueConfig::default_for(Priority::Low),
        }
    }
}

/// Configuration for the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Retry cap for records submitted without their own.
    pub default_max_retries: u32,
    /// TTL for records submitted without their own.
    pub default_ttl_ms: u64,
    pub queues: QueueConfigs,
    /// Below this bandwidth delta encoding kicks in.
    pub low_bandwidth_mbps: f64,
    /// Payloads smaller than this are never delta encoded.
    pub delta_min_bytes: u64,
    /// Ceiling for a single transmission.
    pub transmit_timeout_ms: u64,
    pub network_sample_interval_ms: u64,
    pub expiry_sweep_interval_ms: u64,
    /// SyncAttempts retained per record.
    pub attempt_history_limit: usize,
    /// Conflict resolutions retained in the engine's log; oldest go first.
    pub conflict_log_limit: usize,
    /// Records the store may hold, terminal ones included.
    pub max_records: usize,
    pub repair_strategy: RepairStrategy,
    pub retry: RetryConfig,
    /// Initial ordered rule set.
    pub policies: Vec<SyncPolicy>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            default_ttl_ms: 24 * 60 * 60 * 1000,
            queues: QueueConfigs::default(),
            low_bandwidth_mbps: 2.0,
            delta_min_bytes: 1024,
            transmit_timeout_ms: 30_000,
            network_sample_interval_ms: 5_000,
            expiry_sweep_interval_ms: 60_000,
            attempt_history_limit: 50,
            conflict_log_limit: 1_000,
            max_records: 100_000,
            repair_strategy: RepairStrategy::Retry,
            retry: RetryConfig::default(),
            policies: default_policies(),
        }
    }
}

impl EngineConfig {
    pub fn default_ttl(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.default_ttl_ms as i64)
    }

    pub fn transmit_timeout(&self) -> Duration {
        Duration::from_millis(self.transmit_timeout_ms)
    }

    pub fn network_sample_interval(&self) -> Duration {
        Duration::from_millis(self.network_sample_interval_ms)
    }

    pub fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.expiry_sweep_interval_ms)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        for tier in Priority::ALL {
            self.queues.get(tier).validate(tier)?;
        }
        if !(self.low_bandwidth_mbps > 0.0) {
            return Err(Error::InvalidInput(
                "low_bandwidth_mbps must be positive".to_string(),
            ));
        }
        if self.transmit_timeout_ms == 0
            || self.network_sample_interval_ms == 0
            || self.expiry_sweep_interval_ms == 0
        {
            return Err(Error::InvalidInput("Intervals must be non-zero".to_string()));
        }
        if self.attempt_history_limit == 0 || self.conflict_log_limit == 0 || self.max_records == 0 {
            return Err(Error::InvalidInput(
                "attempt_history_limit, conflict_log_limit and max_records must be non-zero"
                    .to_string(),
            ));
        }
        if self.default_ttl_ms == 0 {
            return Err(Error::InvalidInput("default_ttl_ms must be non-zero".to_string()));
        }
        for policy in &self.policies {
            policy.validate()?;
        }
        Ok(())
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON and validate.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path).await.map_err(Error::Io)?;
        Self::from_json(&content)
    }
}
