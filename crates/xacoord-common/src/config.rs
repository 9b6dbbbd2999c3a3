//! Configuration management for xacoord

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Main configuration structure for xacoord
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Transaction manager configuration
    #[serde(default)]
    pub transaction: TransactionConfig,

    /// Recovery manager configuration
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Recovery log configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML or JSON file
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| Error::Config(format!("Failed to read config file: {e}")))?;

        let config: Config = if path.as_ref().extension().is_some_and(|ext| ext == "toml") {
            toml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse TOML config: {e}")))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse JSON config: {e}")))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Load the file when it exists, otherwise fall back to defaults
    pub async fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if tokio::fs::try_exists(path.as_ref()).await.unwrap_or(false) {
            Self::load(path).await
        } else {
            tracing::debug!(
                "Config file {} not found, using defaults",
                path.as_ref().display()
            );
            Ok(Self::default())
        }
    }

    /// Reject settings that can never work
    pub fn validate(&self) -> Result<()> {
        if self.transaction.max_timeout_secs != 0
            && self.transaction.default_timeout_secs > self.transaction.max_timeout_secs
        {
            return Err(Error::Config(format!(
                "default_timeout_secs ({}) exceeds max_timeout_secs ({})",
                self.transaction.default_timeout_secs, self.transaction.max_timeout_secs
            )));
        }
        if self.transaction.heuristic_retry_interval_ms == 0 {
            return Err(Error::Config(
                "heuristic_retry_interval_ms must be positive".to_string(),
            ));
        }
        if self.recovery.retry_interval_ms == 0 {
            return Err(Error::Config("retry_interval_ms must be positive".to_string()));
        }
        if self.log.max_segment_bytes < 4096 {
            return Err(Error::Config(
                "max_segment_bytes must be at least 4096".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Timeout applied when `begin` is called with 0 (0 = no timeout)
    pub default_timeout_secs: u64,
    /// Upper bound on any requested timeout (0 = unbounded)
    pub max_timeout_secs: u64,
    /// Commit a lone voting resource without prepare
    pub one_phase_optimization: bool,
    /// Allow a one-phase-only resource alongside two-phase resources
    pub accept_heuristic_hazard: bool,
    /// Base delay between completion retries of a failing branch
    pub heuristic_retry_interval_ms: u64,
    /// Completion passes per branch before giving up (0 = unlimited)
    pub heuristic_retry_limit: u32,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 120,
            max_timeout_secs: 0,
            one_phase_optimization: true,
            accept_heuristic_hazard: false,
            heuristic_retry_interval_ms: 1000,
            heuristic_retry_limit: 5,
        }
    }
}

impl TransactionConfig {
    /// Resolve a requested timeout against the default and the maximum
    pub fn effective_timeout(&self, requested_secs: u64) -> Duration {
        let secs = if requested_secs == 0 {
            self.default_timeout_secs
        } else {
            requested_secs
        };
        let secs = if self.max_timeout_secs == 0 {
            secs
        } else {
            secs.min(self.max_timeout_secs)
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Run a recovery pass when the service starts
    pub recover_on_startup: bool,
    /// Base delay between passes while resources are unavailable
    pub retry_interval_ms: u64,
    /// How long completion markers survive a prune
    pub confirmation_window_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            recover_on_startup: true,
            retry_interval_ms: 10_000,
            confirmation_window_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Directory holding the recovery log segments
    pub dir: String,
    /// Segment size that triggers rotation
    pub max_segment_bytes: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: "/var/lib/xacoord/tranlog".to_string(),
            max_segment_bytes: 16 * 1024 * 1024, // 16MB
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
