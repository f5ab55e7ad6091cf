//! Rate-paced load submission
//!
//! Transfer `i` is sent no earlier than `start + i / tx_per_sec`, with every
//! target computed from the original start so pacing error does not
//! accumulate. After the schedule is drained the dispatcher waits for all
//! receipts and then for `CONFIRMATION_BLOCKS` more blocks, and writes each
//! accepted transaction joined with the times of its inclusion block and the
//! blocks after it.

use super::AccountLedger;
use crate::chain::{BlockHandle, RpcGateway};
use crate::error::LoadResult;
use crate::gas::GasPriceHandle;
use crate::results::{
    BlockTimes, MinedTx, PlannedTransfer, ResultSink, TxLatency, TxResult, LATENCY_BLOCKS,
};

use chrono::Utc;
use ethers::types::{TransactionReceipt, H256, U256};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Blocks mined after the last load transaction before the run is complete
pub const CONFIRMATION_BLOCKS: u64 = 12;

/// Receipts polled at once while waiting for the load to be mined
const RECEIPT_CONCURRENCY: usize = 32;

/// Tokens moved by each load transaction
const TOKENS_PER_TX: u64 = 1;

/// Outcome of a dispatch run
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub submitted: usize,
    pub failed: usize,
    /// Accepted transactions, in dispatch order
    pub accepted: Vec<TxResult>,
    /// Highest block containing one of the submitted transactions
    pub last_mined_block: Option<u64>,
    /// Worst delay behind a transfer's target time
    pub max_lag: Duration,
}

/// Drains a planned schedule at a fixed rate
pub struct RateDispatcher {
    gateway: Arc<RpcGateway>,
    ledger: Arc<AccountLedger>,
    gas: GasPriceHandle,
    blocks: BlockHandle,
    sink: Arc<dyn ResultSink<TxResult>>,
    latency_sink: Arc<dyn ResultSink<TxLatency>>,
    tx_per_sec: u64,
    token_gas_limit: u64,
    receipt_poll: Duration,
}

impl RateDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<RpcGateway>,
        ledger: Arc<AccountLedger>,
        gas: GasPriceHandle,
        blocks: BlockHandle,
        sink: Arc<dyn ResultSink<TxResult>>,
        latency_sink: Arc<dyn ResultSink<TxLatency>>,
        tx_per_sec: u64,
        token_gas_limit: u64,
        receipt_poll: Duration,
    ) -> Self {
        Self {
            gateway,
            ledger,
            gas,
            blocks,
            sink,
            latency_sink,
            tx_per_sec,
            token_gas_limit,
            receipt_poll,
        }
    }

    /// Offset of transfer `index` from the start of the run
    pub fn target_offset(&self, index: usize) -> Duration {
        Duration::from_secs_f64(index as f64 / self.tx_per_sec as f64)
    }

    /// Dispatch the whole schedule, wait for it to be mined and confirmed,
    /// then record inclusion latency
    pub async fn run(&self, transfers: &[PlannedTransfer]) -> LoadResult<DispatchReport> {
        let mut report = self.dispatch(transfers).await?;

        info!(
            "Dispatched {} transactions ({} failed), worst lag {:?}",
            report.submitted, report.failed, report.max_lag
        );

        let hashes: Vec<H256> = report.accepted.iter().map(|r| r.tx_hash).collect();
        let receipts = self.wait_for_receipts(&hashes).await;
        report.last_mined_block = receipts
            .values()
            .filter_map(|receipt| receipt.block_number)
            .map(|n| n.as_u64())
            .max();

        if let Some(last) = report.last_mined_block {
            let target = last + CONFIRMATION_BLOCKS;
            info!("Last load transaction mined in block {}, waiting for block {}", last, target);
            self.blocks.wait_for_block(target).await?;
        }

        self.record_latency(&report.accepted, &receipts).await?;

        info!("Load run complete");
        Ok(report)
    }

    /// Paced submission loop. Results are appended in dispatch order.
    pub async fn dispatch(&self, transfers: &[PlannedTransfer]) -> LoadResult<DispatchReport> {
        let mut report = DispatchReport::default();
        let start = Instant::now();

        info!(
            "Dispatching {} transfers at {} tx/s",
            transfers.len(),
            self.tx_per_sec
        );

        for (index, transfer) in transfers.iter().enumerate() {
            let target = start + self.target_offset(index);
            if Instant::now() < target {
                tokio::time::sleep_until(target).await;
            }

            let lag = Instant::now().saturating_duration_since(target);
            report.max_lag = report.max_lag.max(lag);
            crate::metrics::record_dispatch_lag(lag.as_secs_f64());

            match self.submit(transfer).await? {
                Some(result) => {
                    report.submitted += 1;
                    report.accepted.push(result);
                }
                None => report.failed += 1,
            }
        }

        Ok(report)
    }

    /// Send one transfer; `None` if the node refused it
    async fn submit(&self, transfer: &PlannedTransfer) -> LoadResult<Option<TxResult>> {
        let account = self.ledger.get(&transfer.from)?;
        let nonce = self.ledger.get_use_nonce(&account);
        let gas_price = self.gas.get_latest_gas_price();
        let block_at_submit = self.blocks.get_latest_block_number();
        let submitted_at = Utc::now().timestamp();

        let sent = self
            .gateway
            .send_tokens(
                &account,
                nonce,
                transfer.to,
                U256::from(TOKENS_PER_TX),
                gas_price,
                self.token_gas_limit,
            )
            .await;

        match sent {
            Ok(sent) => {
                debug!(
                    "Sent {:?} from {:?} nonce {} at {} wei",
                    sent.hash, transfer.from, nonce, sent.gas_price
                );
                let result = TxResult {
                    from: transfer.from,
                    to: transfer.to,
                    tx_hash: sent.hash,
                    submitted_at,
                    gas_price: sent.gas_price,
                    block_at_submit,
                };
                self.sink.append(&result)?;
                crate::metrics::record_tx_submitted("load");
                Ok(Some(result))
            }
            Err(e) => {
                // a nonce the node already saw used must not be handed out again
                let released = !e.is_nonce_consumed() && self.ledger.release_nonce(&account, nonce);
                error!(
                    "Load transfer from {:?} to {:?} (nonce {}, released: {}) failed: {}",
                    transfer.from, transfer.to, nonce, released, e
                );
                crate::metrics::record_tx_failed("load");
                Ok(None)
            }
        }
    }

    /// Wait until every hash has a mined receipt. Hashes whose wait failed
    /// are missing from the result.
    pub async fn wait_for_receipts(&self, hashes: &[H256]) -> HashMap<H256, TransactionReceipt> {
        info!("Waiting for {} receipts", hashes.len());

        let results: Vec<_> = stream::iter(hashes.iter().copied())
            .map(|hash| async move {
                (hash, self.gateway.wait_for_receipt(hash, self.receipt_poll).await)
            })
            .buffer_unordered(RECEIPT_CONCURRENCY)
            .collect()
            .await;

        results
            .into_iter()
            .filter_map(|(hash, result)| match result {
                Ok(receipt) => Some((hash, receipt)),
                Err(e) => {
                    warn!("Gave up on receipt for {:?}: {}", hash, e);
                    None
                }
            })
            .collect()
    }

    /// Append one `TxLatency` row per accepted transaction, in dispatch order.
    ///
    /// Block times come from the block monitor when it observed the block,
    /// otherwise from the node with no local timestamp.
    pub async fn record_latency(
        &self,
        accepted: &[TxResult],
        receipts: &HashMap<H256, TransactionReceipt>,
    ) -> LoadResult<()> {
        let mut fetched = HashMap::new();
        let mut rows = Vec::with_capacity(accepted.len());

        for tx in accepted {
            let receipt = receipts
                .get(&tx.tx_hash)
                .and_then(|receipt| receipt.block_number.map(|n| (receipt, n.as_u64())));

            let mined = match receipt {
                Some((receipt, block_number)) => {
                    let mut blocks = Vec::with_capacity(LATENCY_BLOCKS as usize);
                    for number in block_number..block_number + LATENCY_BLOCKS {
                        blocks.push(self.block_times(number, &mut fetched).await?);
                    }
                    Some(MinedTx {
                        gas_used: receipt.gas_used.unwrap_or_default(),
                        block_number,
                        blocks,
                    })
                }
                None => None,
            };

            rows.push(TxLatency {
                tx: tx.clone(),
                mined,
            });
        }

        self.latency_sink.append_all(&rows)?;
        info!(
            "Recorded inclusion latency for {} transactions ({} blocks fetched from node)",
            rows.len(),
            fetched.len()
        );
        Ok(())
    }

    async fn block_times(
        &self,
        number: u64,
        fetched: &mut HashMap<u64, BlockTimes>,
    ) -> LoadResult<BlockTimes> {
        if let Some(times) = self.blocks.observed(number) {
            return Ok(times);
        }
        if let Some(times) = fetched.get(&number) {
            return Ok(*times);
        }

        let block = self.gateway.get_block_wait(number, self.receipt_poll).await?;
        let times = BlockTimes {
            block_timestamp: block.timestamp.low_u64() as i64,
            observed_timestamp: None,
        };
        fetched.insert(number, times);
        Ok(times)
    }
}
