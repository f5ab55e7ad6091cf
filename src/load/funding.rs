//! Pre-funding of load accounts
//!
//! Every account with planned sends receives enough native currency for its
//! load transactions plus one token per planned send. Funding transactions
//! are paced, awaited until mined, and the actual spend is compared with
//! the pre-flight estimate.

use crate::chain::RpcGateway;
use crate::config::LoadConfig;
use crate::error::{LoadError, LoadResult};
use crate::gas::{calculate_cost, scale_by, wei_to_gwei, GasPriceHandle};
use crate::results::PlannedTransfer;
use crate::tx::{Account, AccountLedger};

use ethers::types::{Address, H256, U256};
use ethers::utils::format_ether;
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Planned sends per source account
pub fn send_counts(transfers: &[PlannedTransfer]) -> HashMap<Address, u64> {
    let mut counts = HashMap::new();
    for transfer in transfers {
        *counts.entry(transfer.from).or_insert(0) += 1;
    }
    counts
}

/// Pre-flight cost of a run, in wei
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FundingEstimate {
    /// Gas for one ether transfer per account at the funding price cap
    pub ether_transfer_cost: U256,
    /// Gas for one initial token grant per account at the funding price cap
    pub token_grant_cost: U256,
    /// Ether handed to accounts to pay for their load transactions
    pub load_cost: U256,
    /// Ether allowance per load transaction
    pub ether_per_tx: U256,
}

impl FundingEstimate {
    pub fn total(&self) -> U256 {
        self.ether_transfer_cost + self.token_grant_cost + self.load_cost
    }
}

/// Outcome of a funding round
#[derive(Debug, Clone, Default)]
pub struct FundingReport {
    pub funded: usize,
    /// Accounts with planned sends that could not be funded
    pub skipped: Vec<Address>,
    pub tx_hashes: Vec<H256>,
    pub balance_before: U256,
    pub balance_after: U256,
}

impl FundingReport {
    pub fn spent(&self) -> U256 {
        self.balance_before.saturating_sub(self.balance_after)
    }
}

/// Funds load accounts from the funder account
pub struct FundingPlanner {
    gateway: Arc<RpcGateway>,
    ledger: Arc<AccountLedger>,
    config: LoadConfig,
    receipt_poll: Duration,
}

impl FundingPlanner {
    pub fn new(
        gateway: Arc<RpcGateway>,
        ledger: Arc<AccountLedger>,
        config: LoadConfig,
        receipt_poll: Duration,
    ) -> Self {
        Self {
            gateway,
            ledger,
            config,
            receipt_poll,
        }
    }

    /// Ether each load transaction is allowed to spend on gas
    pub fn ether_per_tx(&self, load_gas_price: U256) -> U256 {
        scale_by(
            calculate_cost(self.config.token_transfer_gas_limit, load_gas_price),
            self.config.prefund_multiplier,
        )
    }

    /// Gas price for funding sends, capped by `funding_max_gas_price`
    pub fn funding_gas_price(&self, latest: U256) -> U256 {
        latest.min(U256::from(self.config.funding_max_gas_price))
    }

    /// Upper bound of what funding and the load will cost the funder
    pub fn estimate(
        &self,
        account_count: usize,
        transfers: &[PlannedTransfer],
        load_gas_price: U256,
    ) -> FundingEstimate {
        let max_price = U256::from(self.config.funding_max_gas_price);
        let accounts = U256::from(account_count);
        let ether_per_tx = self.ether_per_tx(load_gas_price);

        FundingEstimate {
            ether_transfer_cost: calculate_cost(self.config.ether_transfer_gas_limit, max_price) * accounts,
            token_grant_cost: calculate_cost(self.config.initial_token_transfer_gas_limit, max_price)
                * accounts,
            load_cost: ether_per_tx * U256::from(transfers.len()),
            ether_per_tx,
        }
    }

    /// Send ether and tokens to every account with planned sends, then wait
    /// for all funding transactions to be mined.
    pub async fn fund(
        &self,
        funder: &Account,
        accounts: &[Arc<Account>],
        transfers: &[PlannedTransfer],
        gas: &GasPriceHandle,
        estimate: &FundingEstimate,
    ) -> LoadResult<FundingReport> {
        let mut report = FundingReport {
            balance_before: self.gateway.get_balance(funder.address()).await?,
            ..Default::default()
        };

        if report.balance_before < estimate.total() {
            let shortfall = LoadError::InsufficientBalance {
                address: format!("{:?}", funder.address()),
                have: format_ether(report.balance_before),
                need: format_ether(estimate.total()),
            };
            warn!("{}; accounts that cannot be funded will be skipped", shortfall);
        }

        let counts = send_counts(transfers);
        let interval = self.config.funding_interval();
        let start = Instant::now();
        let mut sends = 0u32;

        for account in accounts {
            let address = account.address();
            let Some(&count) = counts.get(&address) else {
                debug!("Account {:?} has no planned sends, not funding", address);
                continue;
            };

            let ether = estimate.ether_per_tx * U256::from(count);

            tokio::time::sleep_until(start + interval * sends).await;
            sends += 1;
            let gas_price = self.funding_gas_price(gas.get_latest_gas_price());
            let nonce = self.ledger.get_use_nonce(funder);
            let ether_hash = match self
                .gateway
                .send_ether(funder, nonce, address, ether, gas_price, self.config.ether_transfer_gas_limit)
                .await
            {
                Ok(sent) => sent.hash,
                Err(e) => {
                    self.skip(funder, nonce, address, "ether", e, &mut report);
                    continue;
                }
            };
            report.tx_hashes.push(ether_hash);
            crate::metrics::record_tx_submitted("funding");
            info!(
                "Funding {:?} with {} ETH for {} sends: {:?}",
                address,
                format_ether(ether),
                count,
                ether_hash
            );

            tokio::time::sleep_until(start + interval * sends).await;
            sends += 1;
            let gas_price = self.funding_gas_price(gas.get_latest_gas_price());
            let nonce = self.ledger.get_use_nonce(funder);
            match self
                .gateway
                .send_tokens(
                    funder,
                    nonce,
                    address,
                    U256::from(count),
                    gas_price,
                    self.config.initial_token_transfer_gas_limit,
                )
                .await
            {
                Ok(sent) => {
                    report.tx_hashes.push(sent.hash);
                    report.funded += 1;
                    crate::metrics::record_tx_submitted("funding");
                    debug!("Granted {} tokens to {:?}: {:?}", count, address, sent.hash);
                }
                Err(e) => self.skip(funder, nonce, address, "token", e, &mut report),
            }
        }

        info!("Waiting for {} funding transactions", report.tx_hashes.len());
        for hash in &report.tx_hashes {
            let receipt = self.gateway.wait_for_receipt(*hash, self.receipt_poll).await?;
            debug!("Funding tx {:?} mined in block {:?}", hash, receipt.block_number);
        }

        report.balance_after = self.gateway.get_balance(funder.address()).await?;
        let spent = report.spent();
        crate::metrics::record_funding_spent(wei_to_gwei(spent) / 1e9);

        info!(
            "Funding complete: {} accounts funded, {} skipped, spent {} ETH of {} ETH estimated",
            report.funded,
            report.skipped.len(),
            format_ether(spent),
            format_ether(estimate.total())
        );

        Ok(report)
    }

    fn skip(
        &self,
        funder: &Account,
        nonce: u64,
        address: Address,
        what: &str,
        cause: LoadError,
        report: &mut FundingReport,
    ) {
        if cause.is_nonce_consumed() {
            warn!("Funder nonce {} already used on chain, not reusing it", nonce);
        } else {
            self.ledger.release_nonce(funder, nonce);
        }
        crate::metrics::record_tx_failed("funding");
        if cause.is_insufficient_funds() {
            warn!("Funder cannot cover {} funding of {:?}, skipping: {}", what, address, cause);
        } else {
            error!("{} funding of {:?} failed, skipping: {}", what, address, cause);
        }
        report.skipped.push(address);
    }
}

/// Show the estimate and ask the operator to proceed
pub fn confirm_spend<R: BufRead, W: Write>(
    estimate: &FundingEstimate,
    balance: U256,
    input: &mut R,
    output: &mut W,
) -> LoadResult<bool> {
    let prompt_error = |e: std::io::Error| LoadError::Internal(format!("confirmation prompt failed: {}", e));

    writeln!(
        output,
        "Estimated cost: {} ETH (ether transfers {}, token grants {}, load {})",
        format_ether(estimate.total()),
        format_ether(estimate.ether_transfer_cost),
        format_ether(estimate.token_grant_cost),
        format_ether(estimate.load_cost)
    )
    .map_err(prompt_error)?;
    write!(output, "Funder balance: {} ETH. Proceed? [y/N] ", format_ether(balance))
        .map_err(prompt_error)?;
    output.flush().map_err(prompt_error)?;

    let mut answer = String::new();
    input.read_line(&mut answer).map_err(prompt_error)?;

    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}
