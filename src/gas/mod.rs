//! Gas pricing: oracle access, the background price monitor, and cost math

mod monitor;
mod oracle;

pub use monitor::{GasPriceHandle, GasPriceMonitor};
pub use oracle::{GasOracle, HttpGasOracle};

use ethers::types::U256;

/// Precision used when scaling wei amounts by a float multiplier
const MULTIPLIER_SCALE: u64 = 1_000_000;

/// Total cost in wei of `gas_limit` units at `gas_price`
pub fn calculate_cost(gas_limit: u64, gas_price: U256) -> U256 {
    U256::from(gas_limit) * gas_price
}

/// `value * multiplier`, with the multiplier rounded to six decimals
pub fn scale_by(value: U256, multiplier: f64) -> U256 {
    let scaled = (multiplier * MULTIPLIER_SCALE as f64).round().max(0.0) as u64;
    value * U256::from(scaled) / U256::from(MULTIPLIER_SCALE)
}

/// Gas price for a replacement send
pub fn bump_gas_price(gas_price: U256, bump_wei: u64) -> U256 {
    gas_price.saturating_add(U256::from(bump_wei))
}

pub fn wei_to_gwei(wei: U256) -> f64 {
    wei.low_u128() as f64 / 1e9
}
