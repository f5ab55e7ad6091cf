//! Configuration management for the load generator
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub node: NodeConfig,
    pub funder: FunderConfig,
    pub token: TokenConfig,
    pub oracle: OracleConfig,
    pub load: LoadConfig,
    #[serde(default)]
    pub send: SendPolicy,
    #[serde(default)]
    pub funding: FundingConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    pub output: OutputConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    pub request_timeout_ms: u64,
    pub retry_delay_ms: u64,
    pub receipt_poll_interval_ms: u64,
}

impl NodeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunderConfig {
    pub private_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OracleConfig {
    pub url: String,
    pub timeout_ms: u64,
}

/// Immutable run parameters. Gas prices are in wei.
#[derive(Debug, Clone, Deserialize)]
pub struct LoadConfig {
    pub test_duration_secs: u64,
    pub account_count: usize,
    pub tx_per_sec: u64,
    pub gas_tier: String,
    pub funding_gas_tier: String,
    pub funding_tx_per_sec: u64,
    pub funding_max_gas_price: u64,
    pub prefund_multiplier: f64,
    pub gas_update_interval_secs: u64,
    /// Seconds between head polls; fractions allowed
    pub block_update_interval_secs: f64,
    pub ether_transfer_gas_limit: u64,
    pub initial_token_transfer_gas_limit: u64,
    pub token_transfer_gas_limit: u64,
}

impl LoadConfig {
    /// Number of load transactions the run will submit
    pub fn total_transactions(&self) -> usize {
        (self.test_duration_secs * self.tx_per_sec) as usize
    }

    pub fn gas_update_interval(&self) -> Duration {
        Duration::from_secs(self.gas_update_interval_secs)
    }

    pub fn block_update_interval(&self) -> Duration {
        Duration::from_secs_f64(self.block_update_interval_secs)
    }

    pub fn funding_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.funding_tx_per_sec as f64)
    }
}

/// What to do when the node rejects a signed transaction.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SendPolicy {
    /// Re-sign once with `gas_price + bump` instead of failing
    pub underpriced_gas_bump_wei: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FundingConfig {
    #[serde(default)]
    pub require_confirmation: bool,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub backfill_skipped_blocks: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("ETHLOAD_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse and validate a configuration document
    pub fn parse(raw: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(raw);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.node.rpc_url.is_empty() {
            anyhow::bail!("node.rpc_url is required");
        }
        if self.funder.private_key.is_empty() {
            anyhow::bail!("funder.private_key is required");
        }
        if self.token.address.is_empty() {
            anyhow::bail!("token.address is required");
        }
        if self.oracle.url.is_empty() {
            anyhow::bail!("oracle.url is required");
        }

        let load = &self.load;
        if load.account_count == 0 {
            anyhow::bail!("load.account_count must be positive");
        }
        if load.tx_per_sec == 0 {
            anyhow::bail!("load.tx_per_sec must be positive");
        }
        if load.funding_tx_per_sec == 0 {
            anyhow::bail!("load.funding_tx_per_sec must be positive");
        }
        if !(load.prefund_multiplier > 0.0) {
            anyhow::bail!("load.prefund_multiplier must be positive");
        }
        if !(load.block_update_interval_secs.is_finite() && load.block_update_interval_secs > 0.0) {
            anyhow::bail!("load.block_update_interval_secs must be a positive number of seconds");
        }
        if load.gas_tier.is_empty() || load.funding_gas_tier.is_empty() {
            anyhow::bail!("load.gas_tier and load.funding_gas_tier are required");
        }

        if self.funding.dry_run && self.funding.require_confirmation {
            tracing::warn!("funding.dry_run is set - confirmation prompt will not be shown");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = match regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}") {
        Ok(re) => re,
        Err(_) => return result,
    };

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
