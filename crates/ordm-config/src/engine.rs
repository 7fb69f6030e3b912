use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::LoadedConfig;

pub const DEFAULT_MAX_PER_TRANSACTION: i64 = 10;
pub const DEFAULT_LEASE_SECONDS: i64 = 120;
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";

/// Typed view of the merged configuration. Every field has a default so an
/// empty document is a valid config.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub engine: EngineSection,
    pub stuck: StuckSection,
    pub oracle: OracleSection,
    pub daemon: DaemonSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// System-wide ceiling on one claim's quantity.
    pub max_per_transaction: i64,
    pub lease_seconds: i64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_per_transaction: DEFAULT_MAX_PER_TRANSACTION,
            lease_seconds: DEFAULT_LEASE_SECONDS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StuckSection {
    pub threshold_minutes: i64,
    pub sweep_interval_seconds: u64,
    /// Max candidates examined per sweep.
    pub batch_limit: i64,
}

impl Default for StuckSection {
    fn default() -> Self {
        Self {
            threshold_minutes: 30,
            sweep_interval_seconds: 300,
            batch_limit: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleSection {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for OracleSection {
    fn default() -> Self {
        Self {
            base_url: "https://mempool.space/api".to_string(),
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    pub bind_addr: String,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_loaded(loaded: &LoadedConfig) -> Result<Self> {
        let cfg: EngineConfig = serde_json::from_value(loaded.config_json.clone())
            .context("config does not match EngineConfig")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.max_per_transaction < 1 {
            bail!(
                "CONFIG_INVALID engine.max_per_transaction={} must be >= 1",
                self.engine.max_per_transaction
            );
        }
        if self.engine.lease_seconds < 1 {
            bail!(
                "CONFIG_INVALID engine.lease_seconds={} must be >= 1",
                self.engine.lease_seconds
            );
        }
        if self.stuck.threshold_minutes < 1 {
            bail!(
                "CONFIG_INVALID stuck.threshold_minutes={} must be >= 1",
                self.stuck.threshold_minutes
            );
        }
        if self.stuck.sweep_interval_seconds == 0 {
            bail!("CONFIG_INVALID stuck.sweep_interval_seconds must be > 0");
        }
        if self.stuck.batch_limit < 1 {
            bail!(
                "CONFIG_INVALID stuck.batch_limit={} must be >= 1",
                self.stuck.batch_limit
            );
        }
        Ok(())
    }
}
