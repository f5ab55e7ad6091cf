//! Load preparation: the transfer schedule and account funding

mod funding;
mod plan;

pub use funding::{confirm_spend, FundingPlanner};
pub use plan::plan_transfers;

#[cfg(test)]
pub(crate) fn test_load_config(
    test_duration_secs: u64,
    tx_per_sec: u64,
    account_count: usize,
) -> crate::config::LoadConfig {
    crate::config::LoadConfig {
        test_duration_secs,
        account_count,
        tx_per_sec,
        gas_tier: "average".to_string(),
        funding_gas_tier: "safeLow".to_string(),
        funding_tx_per_sec: 10,
        funding_max_gas_price: 2_000_000_000,
        prefund_multiplier: 1.5,
        gas_update_interval_secs: 15,
        block_update_interval_secs: 0.5,
        ether_transfer_gas_limit: 21_000,
        initial_token_transfer_gas_limit: 60_000,
        token_transfer_gas_limit: 40_000,
    }
}
