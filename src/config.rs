use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub chain: ChainConfig,
    pub oracle: OracleConfig,
    pub sync: SyncConfig,
    pub trigger: TriggerConfig,
    pub database: DatabaseConfig,
    pub collaterals: Vec<CollateralConfigEntry>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// Redundant RPC websocket endpoints, in priority order
    pub rpc_urls: Vec<String>,
    /// Block-height lead a standby provider needs before failover
    #[serde(default = "default_max_block_drift")]
    pub max_block_drift: u64,
    /// Delay before an observed event is considered confirmed
    #[serde(default = "default_confirmation_delay_ms")]
    pub confirmation_delay_ms: u64,
    /// Private key used to sign trigger transactions (keeper modes only)
    #[serde(default)]
    pub keeper_key: Option<String>,
}

fn default_max_block_drift() -> u64 {
    2
}

fn default_confirmation_delay_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct OracleConfig {
    /// Price-proof endpoint base URL
    pub endpoint: String,
    /// Poll interval for price ingestion
    #[serde(default = "default_price_poll_ms")]
    pub poll_interval_ms: u64,
    /// Request timeout
    #[serde(default = "default_oracle_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_price_poll_ms() -> u64 {
    3_000
}

fn default_oracle_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Bulk reconciliation interval
    #[serde(default = "default_reconcile_secs")]
    pub reconcile_interval_secs: u64,
    /// Delay before retrying a failed reconciliation pass
    #[serde(default = "default_reconcile_retry_secs")]
    pub reconcile_retry_secs: u64,
}

fn default_reconcile_secs() -> u64 {
    61
}

fn default_reconcile_retry_secs() -> u64 {
    2
}

impl SyncConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn reconcile_retry(&self) -> Duration {
        Duration::from_secs(self.reconcile_retry_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerConfig {
    /// Pause between sequential trigger submissions
    #[serde(default = "default_send_delay_ms")]
    pub delay_between_sends_ms: u64,
    /// Longer pause after a failed submission
    #[serde(default = "default_failure_delay_ms")]
    pub delay_after_failure_ms: u64,
}

fn default_send_delay_ms() -> u64 {
    200
}

fn default_failure_delay_ms() -> u64 {
    2_000
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            delay_between_sends_ms: default_send_delay_ms(),
            delay_after_failure_ms: default_failure_delay_ms(),
        }
    }
}

impl TriggerConfig {
    pub fn delay_between_sends(&self) -> Duration {
        Duration::from_millis(self.delay_between_sends_ms)
    }

    pub fn delay_after_failure(&self) -> Duration {
        Duration::from_millis(self.delay_after_failure_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

/// One supported collateral and its contract addresses
#[derive(Debug, Clone, Deserialize)]
pub struct CollateralConfigEntry {
    /// Stable index used in trade keys and bus payloads
    pub index: u8,
    /// Display symbol, e.g. "USDC"
    pub symbol: String,
    pub storage_address: String,
    pub trading_address: String,
    pub callbacks_address: String,
    pub borrowing_fees_address: String,
    pub price_aggregator_address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter, e.g. "info" or "perpd=debug"
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional directory for rotated file logs
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from Perpd.toml (if present) and PERPD_* env vars.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("Perpd.toml")
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(Environment::with_prefix("PERPD").separator("__"));

        builder.build()?.try_deserialize()
    }

    /// Startup validation. Failures here are the only fatal configuration
    /// errors; everything later degrades per-operation.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.chain.rpc_urls.is_empty() {
            return Err(crate::error::PerpdError::MissingConfig(
                "chain.rpc_urls must list at least one endpoint".into(),
            ));
        }
        if self.collaterals.is_empty() {
            return Err(crate::error::PerpdError::MissingConfig(
                "collaterals must list at least one entry".into(),
            ));
        }
        if self.oracle.endpoint.is_empty() {
            return Err(crate::error::PerpdError::MissingConfig(
                "oracle.endpoint is required".into(),
            ));
        }
        Ok(())
    }
}
