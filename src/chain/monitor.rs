//! Chain head monitor with per-block gas statistics

use super::RpcGateway;
use crate::error::{LoadError, LoadResult};
use crate::gas::wei_to_gwei;
use crate::results::{BlockStat, BlockTimes, ResultSink};
use crate::stats::{compute_block_stats, BlockStats};
use crate::task::MonitorTask;

use chrono::Utc;
use dashmap::DashMap;
use ethers::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Observed block times by block number
pub type BlockTimeline = Arc<DashMap<u64, BlockTimes>>;

/// Read side of the published head block number
#[derive(Clone)]
pub struct BlockHandle {
    rx: watch::Receiver<u64>,
    timeline: BlockTimeline,
}

impl BlockHandle {
    pub(crate) fn new(rx: watch::Receiver<u64>, timeline: BlockTimeline) -> Self {
        Self { rx, timeline }
    }

    /// Times recorded for `number`, if the monitor saw that block
    pub fn observed(&self, number: u64) -> Option<BlockTimes> {
        self.timeline.get(&number).map(|entry| *entry)
    }

    /// Most recently observed block number (0 before the first block)
    pub fn get_latest_block_number(&self) -> u64 {
        *self.rx.borrow()
    }

    /// Wait until the published head reaches `number`
    pub async fn wait_for_block(&self, number: u64) -> LoadResult<u64> {
        let mut rx = self.rx.clone();
        let head = rx
            .wait_for(|head| *head >= number)
            .await
            .map_err(|_| LoadError::Cancelled("block monitor stopped".to_string()))?;
        Ok(*head)
    }
}

/// Polls the chain head and records one `BlockStat` per new block
pub struct BlockMonitor {
    gateway: Arc<RpcGateway>,
    sink: Arc<dyn ResultSink<BlockStat>>,
    interval: Duration,
    /// Also record blocks skipped between two polls
    backfill: bool,
    tx: watch::Sender<u64>,
    timeline: BlockTimeline,
    last_seen: Option<u64>,
}

impl BlockMonitor {
    pub fn new(
        gateway: Arc<RpcGateway>,
        sink: Arc<dyn ResultSink<BlockStat>>,
        interval: Duration,
        backfill: bool,
    ) -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            gateway,
            sink,
            interval,
            backfill,
            tx,
            timeline: Arc::new(DashMap::new()),
            last_seen: None,
        }
    }

    pub fn handle(&self) -> BlockHandle {
        BlockHandle::new(self.tx.subscribe(), self.timeline.clone())
    }

    pub fn get_latest_block_number(&self) -> u64 {
        *self.tx.borrow()
    }

    /// Check the head once; returns the block numbers recorded
    pub async fn poll_once(&mut self) -> LoadResult<Vec<u64>> {
        let head = self.gateway.get_latest_block().await?;
        let number = block_number(&head)?;
        let observed = Utc::now().timestamp();

        if matches!(self.last_seen, Some(last) if number <= last) {
            return Ok(Vec::new());
        }

        let mut recorded = Vec::new();

        if let (true, Some(last)) = (self.backfill, self.last_seen) {
            for skipped in last + 1..number {
                match self.gateway.get_block(BlockNumber::Number(skipped.into())).await? {
                    Some(block) => {
                        self.record(&block, observed).await?;
                        recorded.push(skipped);
                    }
                    None => warn!("Skipped block {} not available from node", skipped),
                }
            }
        }

        self.record(&head, observed).await?;
        recorded.push(number);

        Ok(recorded)
    }

    async fn record(&mut self, block: &Block<H256>, observed: i64) -> LoadResult<()> {
        let number = block_number(block)?;
        let stats = self.block_stats(block).await?;
        let block_timestamp = block.timestamp.low_u64() as i64;

        let row = BlockStat {
            block_number: number,
            block_timestamp,
            observed_timestamp: observed,
            timestamp_delta: observed - block_timestamp,
            tx_count: block.transactions.len(),
            avg_gas_price: stats.avg_gas_price,
            median_gas_price: stats.median_gas_price,
            q5_gas_price: stats.q5_gas_price,
            q95_gas_price: stats.q95_gas_price,
        };
        self.sink.append(&row)?;
        self.timeline.insert(
            number,
            BlockTimes {
                block_timestamp,
                observed_timestamp: Some(observed),
            },
        );

        self.last_seen = Some(number);
        self.tx.send_replace(number);
        crate::metrics::record_block_observed(number);

        info!(
            "New block {}: {} txs, delta {}s, median gas {:.2} gwei",
            number, row.tx_count, row.timestamp_delta, row.median_gas_price
        );
        Ok(())
    }

    /// Gas-weighted price statistics over a block's transactions, in gwei
    pub async fn block_stats(&self, block: &Block<H256>) -> LoadResult<BlockStats> {
        let mut samples = Vec::with_capacity(block.transactions.len());

        for hash in &block.transactions {
            match self.gateway.get_transaction(*hash).await? {
                Some(tx) => {
                    let price = wei_to_gwei(tx.gas_price.unwrap_or_default());
                    samples.push((price, tx.gas.low_u64() as f64));
                }
                None => debug!("Transaction {:?} vanished before stats", hash),
            }
        }

        Ok(compute_block_stats(&samples))
    }

    /// Polling loop; exits when `shutdown` is cancelled
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Starting block monitor every {:?}", self.interval);

        loop {
            if let Err(e) = self.poll_once().await {
                warn!("Block monitor poll failed: {}", e);
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("Block monitor stopped at block {:?}", self.last_seen);
    }

    pub fn spawn(self) -> (BlockHandle, MonitorTask) {
        let handle = self.handle();
        let token = CancellationToken::new();
        let join = tokio::spawn(self.run(token.clone()));
        (handle, MonitorTask::new("block monitor", token, join))
    }
}

fn block_number(block: &Block<H256>) -> LoadResult<u64> {
    block
        .number
        .map(|n| n.as_u64())
        .ok_or_else(|| LoadError::Rpc {
            method: "eth_getBlockByNumber",
            message: "block has no number (pending)".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockNodeClient;
    use crate::config::SendPolicy;
    use crate::results::MemorySink;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn block(number: u64, txs: Vec<H256>) -> Block<H256> {
        Block {
            number: Some(U64::from(number)),
            timestamp: U256::from(1_600_000_000u64 + number),
            transactions: txs,
            ..Default::default()
        }
    }

    fn monitor_for(
        heads: Vec<u64>,
        backfill: bool,
        node: Option<MockNodeClient>,
    ) -> (BlockMonitor, Arc<MemorySink<BlockStat>>) {
        let heads = Mutex::new(heads.into_iter().collect::<VecDeque<_>>());
        let mut node = node.unwrap_or_default();
        node.expect_get_block().returning(move |requested| match requested {
            BlockNumber::Latest => {
                let n = heads.lock().unwrap().pop_front().expect("no more heads scripted");
                Ok(Some(block(n, vec![])))
            }
            BlockNumber::Number(n) => Ok(Some(block(n.as_u64(), vec![]))),
            other => panic!("unexpected block request {:?}", other),
        });

        let gateway = Arc::new(RpcGateway::new(
            Arc::new(node),
            1,
            Address::zero(),
            Duration::ZERO,
            SendPolicy::default(),
        ));
        let sink = Arc::new(MemorySink::new());
        let monitor = BlockMonitor::new(gateway, sink.clone(), Duration::from_millis(100), backfill);
        (monitor, sink)
    }

    fn recorded_numbers(sink: &MemorySink<BlockStat>) -> Vec<u64> {
        sink.records().iter().map(|r| r.block_number).collect()
    }

    #[tokio::test]
    async fn test_each_block_recorded_once() {
        let (mut monitor, sink) = monitor_for(vec![5, 5, 6, 6, 8, 7], false, None);
        let handle = monitor.handle();
        assert_eq!(handle.get_latest_block_number(), 0);

        let mut recorded = Vec::new();
        for _ in 0..6 {
            recorded.push(monitor.poll_once().await.unwrap());
        }

        assert_eq!(recorded, vec![vec![5], vec![], vec![6], vec![], vec![8], vec![]]);
        assert_eq!(recorded_numbers(&sink), vec![5, 6, 8]);
        assert_eq!(handle.get_latest_block_number(), 8);
        assert_eq!(monitor.get_latest_block_number(), 8);
    }

    #[tokio::test]
    async fn test_backfill_records_skipped_blocks_in_order() {
        let (mut monitor, sink) = monitor_for(vec![5, 8, 9], true, None);
        for _ in 0..3 {
            monitor.poll_once().await.unwrap();
        }

        let numbers = recorded_numbers(&sink);
        assert_eq!(numbers, vec![5, 6, 7, 8, 9]);
        assert!(numbers.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_block_stats_weighted_by_gas() {
        let mut node = MockNodeClient::new();
        node.expect_get_transaction().returning(|hash| {
            let (gwei, gas) = if hash == H256::from_low_u64_be(1) {
                (1u64, 21_000u64)
            } else {
                (3, 63_000)
            };
            Ok(Some(Transaction {
                hash,
                gas_price: Some(U256::from(gwei) * U256::exp10(9)),
                gas: U256::from(gas),
                ..Default::default()
            }))
        });

        let (monitor, _sink) = monitor_for(vec![], false, Some(node));
        let txs = vec![H256::from_low_u64_be(1), H256::from_low_u64_be(2)];
        let stats = monitor.block_stats(&block(10, txs)).await.unwrap();

        assert_eq!(stats.tx_count, 2);
        assert!((stats.avg_gas_price - 2.5).abs() < 1e-9);
        assert!((stats.q95_gas_price - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_row_fields() {
        let (mut monitor, sink) = monitor_for(vec![42], false, None);
        monitor.poll_once().await.unwrap();

        let row = &sink.records()[0];
        assert_eq!(row.block_number, 42);
        assert_eq!(row.block_timestamp, 1_600_000_042);
        assert_eq!(row.timestamp_delta, row.observed_timestamp - row.block_timestamp);
        assert_eq!(row.tx_count, 0);
        assert_eq!(row.median_gas_price, 0.0);
    }

    #[tokio::test]
    async fn test_observed_times_shared_with_handle() {
        let (mut monitor, sink) = monitor_for(vec![42, 44], false, None);
        let handle = monitor.handle();
        monitor.poll_once().await.unwrap();
        monitor.poll_once().await.unwrap();

        let row = &sink.records()[0];
        assert_eq!(
            handle.observed(42),
            Some(BlockTimes {
                block_timestamp: 1_600_000_042,
                observed_timestamp: Some(row.observed_timestamp),
            })
        );
        assert!(handle.observed(43).is_none());
        assert!(handle.observed(44).is_some());
    }

    #[tokio::test]
    async fn test_wait_for_block() {
        let (tx, rx) = watch::channel(3u64);
        let handle = BlockHandle::new(rx, Arc::new(DashMap::new()));

        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move { handle.wait_for_block(5).await }
        });
        tx.send_replace(4);
        tx.send_replace(6);

        assert_eq!(waiter.await.unwrap().unwrap(), 6);
        assert_eq!(handle.get_latest_block_number(), 6);
    }
}
