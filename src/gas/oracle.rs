//! External gas price oracle

use crate::config::OracleConfig;
use crate::error::{LoadError, LoadResult};

use async_trait::async_trait;
use ethers::types::U256;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Oracle prices are quoted in units of 10^-8 of the native gas price unit
const ORACLE_PRICE_SCALE: f64 = 1e8;

/// Source of tiered gas prices
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GasOracle: Send + Sync {
    /// Current price in wei for a tier such as "safeLow" or "fastest"
    async fn gas_price(&self, tier: &str) -> LoadResult<U256>;
}

/// Oracle reached over HTTP GET returning `{tier: price, ...}`
pub struct HttpGasOracle {
    client: reqwest::Client,
    url: String,
}

impl HttpGasOracle {
    pub fn new(config: &OracleConfig) -> LoadResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("ethload/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| LoadError::Config(format!("Failed to build oracle client: {}", e)))?;

        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }

    async fn fetch(&self) -> LoadResult<HashMap<String, Value>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| self.request_error(e))?
            .error_for_status()
            .map_err(|e| LoadError::Oracle(e.to_string()))?;

        response
            .json::<HashMap<String, Value>>()
            .await
            .map_err(|e| self.request_error(e))
    }

    /// Timeouts are transient like node timeouts; anything else is an oracle failure
    fn request_error(&self, err: reqwest::Error) -> LoadError {
        if err.is_timeout() {
            LoadError::Timeout {
                operation: format!("oracle GET {}", self.url),
            }
        } else if err.is_decode() {
            LoadError::Oracle(format!("invalid oracle response: {}", err))
        } else {
            LoadError::Oracle(format!("request to {} failed: {}", self.url, err))
        }
    }
}

#[async_trait]
impl GasOracle for HttpGasOracle {
    async fn gas_price(&self, tier: &str) -> LoadResult<U256> {
        let prices = self.fetch().await?;
        let price = price_for_tier(&prices, tier)?;
        debug!("Oracle price for {}: {} wei", tier, price);
        Ok(price)
    }
}

/// Extract a tier from an oracle document and convert it to wei
pub fn price_for_tier(prices: &HashMap<String, Value>, tier: &str) -> LoadResult<U256> {
    let raw = prices
        .get(tier)
        .ok_or_else(|| LoadError::Oracle(format!("tier {} missing from oracle response", tier)))?
        .as_f64()
        .ok_or_else(|| LoadError::Oracle(format!("tier {} is not a number", tier)))?;

    if !(raw >= 0.0) {
        return Err(LoadError::Oracle(format!("tier {} has invalid price {}", tier, raw)));
    }

    Ok(U256::from((raw * ORACLE_PRICE_SCALE).round() as u128))
}
