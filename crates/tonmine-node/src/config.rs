//! Node configuration for the tonmine engine.
//!
//! Provides [`NodeConfig`] with defaults for the data directory, logging,
//! reward rules and background task timing. [`NodeConfig::load`] layers an
//! optional TOML file and `TONMINE__*` environment variables over the
//! defaults, e.g. `TONMINE__SETTLEMENT__MAX_BACKLOG_DAYS=3`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tonmine_core::config::{RateConfig, SettlementConfig};
use tonmine_core::constants::DEFAULT_ACTIVITY_RETENTION;
use tonmine_core::error::ValidationError;

use crate::distributor::DistributorConfig;
use crate::retry::RetryPolicy;

/// Prefix of environment overrides; nested keys are separated by `__`.
pub const ENV_PREFIX: &str = "TONMINE";

/// Configuration for a node instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// Log level filter string (e.g. "info", "debug", "tonmine_node_lib=trace").
    pub log_level: String,
    pub rate: RateConfig,
    pub settlement: SettlementConfig,
    pub distributor: DistributorConfig,
    /// Backoff for transient store failures.
    pub retry: RetryPolicy,
    /// How often the sync worker re-checks the ledger while online.
    pub sync_poll_secs: u64,
    /// Display ticker period, clamped to 100..=1000 ms.
    pub ticker_period_ms: u64,
    /// Activity records kept per owner.
    pub activity_retention: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tonmine");

        Self {
            data_dir,
            log_level: "info".to_string(),
            rate: RateConfig::default(),
            settlement: SettlementConfig::default(),
            distributor: DistributorConfig::default(),
            retry: RetryPolicy::default(),
            sync_poll_secs: 30,
            ticker_period_ms: 250,
            activity_retention: DEFAULT_ACTIVITY_RETENTION,
        }
    }
}

impl NodeConfig {
    /// Build the configuration from defaults, an optional TOML file, and the
    /// environment (highest precedence). The result is validated.
    pub fn load(file: Option<&Path>) -> Result<Self, ValidationError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let cfg: NodeConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ValidationError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.rate.validate()?;
        self.settlement.validate()?;
        if self.distributor.concurrency == 0 {
            return Err(ValidationError::Config("distributor.concurrency must be non-zero".into()));
        }
        if self.activity_retention == 0 {
            return Err(ValidationError::Config("activity_retention must be non-zero".into()));
        }
        Ok(())
    }

    /// Path to the RocksDB offline ledger.
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("ledger")
    }

    pub fn sync_poll_interval(&self) -> Duration {
        Duration::from_secs(self.sync_poll_secs.max(1))
    }

    pub fn ticker_period(&self) -> Duration {
        Duration::from_millis(self.ticker_period_ms)
    }
}
