//! Chain module - node access for load generation
//!
//! This module provides:
//! - The raw JSON-RPC surface the load generator consumes (`NodeClient`)
//! - An ethers HTTP implementation with timeout classification
//! - The retrying, signing gateway every other component goes through
//! - The chain head monitor that records per-block statistics

pub mod gateway;
pub mod monitor;
pub mod provider;

pub use gateway::RpcGateway;
pub use monitor::{BlockHandle, BlockMonitor};
pub use provider::EthersNode;

use crate::error::LoadResult;

use async_trait::async_trait;
use ethers::types::{Address, Block, BlockNumber, Bytes, Transaction, TransactionReceipt, H256, U256};

/// Node RPC calls used by the gateway.
///
/// Implementations report transport timeouts as `LoadError::Timeout` and
/// JSON-RPC error responses as `LoadError::Rejected`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// `eth_getBalance`
    async fn get_balance(&self, address: Address) -> LoadResult<U256>;

    /// `eth_getTransactionCount`
    async fn get_transaction_count(&self, address: Address) -> LoadResult<u64>;

    /// `eth_sendRawTransaction`
    async fn send_raw_transaction(&self, raw: Bytes) -> LoadResult<H256>;

    /// `eth_getTransactionReceipt`
    async fn get_transaction_receipt(&self, hash: H256) -> LoadResult<Option<TransactionReceipt>>;

    /// `eth_getBlockByNumber` without full transactions
    async fn get_block(&self, block: BlockNumber) -> LoadResult<Option<Block<H256>>>;

    /// `eth_getTransactionByHash`
    async fn get_transaction(&self, hash: H256) -> LoadResult<Option<Transaction>>;
}
