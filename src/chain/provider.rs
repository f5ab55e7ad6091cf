//! ethers HTTP node client with timeout classification

use super::NodeClient;
use crate::config::NodeConfig;
use crate::error::{LoadError, LoadResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider, ProviderError};
use std::time::Duration;
use tracing::debug;

/// HTTP JSON-RPC client for a single node
pub struct EthersNode {
    /// Chain ID the node is expected to serve
    chain_id: u64,
    /// Underlying ethers provider
    provider: Provider<Http>,
}

impl EthersNode {
    /// Create a node client whose requests expire after the configured timeout
    pub fn new(config: &NodeConfig) -> LoadResult<Self> {
        let url = reqwest::Url::parse(&config.rpc_url)
            .map_err(|e| LoadError::Config(format!("Invalid RPC URL {}: {}", config.rpc_url, e)))?;

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| LoadError::Config(format!("Failed to build HTTP client: {}", e)))?;

        let provider =
            Provider::new(Http::new_with_client(url, client)).interval(Duration::from_millis(100));

        debug!("Created HTTP node client for chain {}: {}", config.chain_id, config.rpc_url);

        Ok(Self {
            chain_id: config.chain_id,
            provider,
        })
    }

    /// Get chain ID
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }
}

#[async_trait]
impl NodeClient for EthersNode {
    async fn get_balance(&self, address: Address) -> LoadResult<U256> {
        self.provider
            .get_balance(address, None)
            .await
            .map_err(|e| classify("eth_getBalance", e))
    }

    async fn get_transaction_count(&self, address: Address) -> LoadResult<u64> {
        self.provider
            .get_transaction_count(address, None)
            .await
            .map(|nonce| nonce.low_u64())
            .map_err(|e| classify("eth_getTransactionCount", e))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> LoadResult<H256> {
        self.provider
            .send_raw_transaction(raw)
            .await
            .map(|pending| pending.tx_hash())
            .map_err(|e| classify("eth_sendRawTransaction", e))
    }

    async fn get_transaction_receipt(&self, hash: H256) -> LoadResult<Option<TransactionReceipt>> {
        self.provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| classify("eth_getTransactionReceipt", e))
    }

    async fn get_block(&self, block: BlockNumber) -> LoadResult<Option<Block<H256>>> {
        self.provider
            .get_block(block)
            .await
            .map_err(|e| classify("eth_getBlockByNumber", e))
    }

    async fn get_transaction(&self, hash: H256) -> LoadResult<Option<Transaction>> {
        self.provider
            .get_transaction(hash)
            .await
            .map_err(|e| classify("eth_getTransactionByHash", e))
    }
}

/// Map a provider failure onto the gateway's error classes
fn classify(method: &'static str, err: ProviderError) -> LoadError {
    if let ProviderError::JsonRpcClientError(inner) = &err {
        if let Some(response) = inner.as_error_response() {
            return LoadError::Rejected {
                method,
                code: response.code,
                message: response.message.clone(),
            };
        }
    }

    if let ProviderError::HTTPError(e) = &err {
        if e.is_timeout() {
            return LoadError::Timeout {
                operation: method.to_string(),
            };
        }
    }

    let message = err.to_string();
    if is_timeout_message(&message) {
        LoadError::Timeout {
            operation: method.to_string(),
        }
    } else {
        LoadError::Rpc { method, message }
    }
}

fn is_timeout_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("timed out") || message.contains("timeout")
}
