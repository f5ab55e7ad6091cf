//! Retrying, signing access to the node
//!
//! Every node call goes through a `TimeoutRetry`: transport timeouts are
//! logged and retried forever after a fixed short sleep, anything else is
//! returned to the caller. Sends sign locally and submit raw transactions.

use super::NodeClient;
use crate::config::SendPolicy;
use crate::error::{LoadError, LoadResult};
use crate::gas::bump_gas_price;
use crate::retry::TimeoutRetry;
use crate::tx::Account;

use ethers::abi::Token;
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// ERC-20 `transfer(address,uint256)` calldata
pub fn transfer_calldata(to: Address, amount: U256) -> Bytes {
    let mut data = ethers::utils::id("transfer(address,uint256)").to_vec();
    data.extend(ethers::abi::encode(&[Token::Address(to), Token::Uint(amount)]));
    data.into()
}

/// A transaction accepted by the node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentTx {
    pub hash: H256,
    /// Gas price the accepted transaction was signed with, in wei
    pub gas_price: U256,
}

/// Node gateway shared by the funder, the monitors and the dispatcher
pub struct RpcGateway {
    node: Arc<dyn NodeClient>,
    chain_id: u64,
    /// ERC-20 contract the load transfers
    token: Address,
    retry: TimeoutRetry,
    policy: SendPolicy,
}

impl RpcGateway {
    pub fn new(
        node: Arc<dyn NodeClient>,
        chain_id: u64,
        token: Address,
        retry_delay: Duration,
        policy: SendPolicy,
    ) -> Self {
        Self {
            node,
            chain_id,
            token,
            retry: TimeoutRetry::new(retry_delay),
            policy,
        }
    }

    /// Number of timed-out node calls that have been retried
    pub fn retries(&self) -> u64 {
        self.retry.retries()
    }

    async fn retry_on_timeout<T, F, Fut>(&self, operation: &'static str, call: F) -> LoadResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LoadResult<T>>,
    {
        self.retry.run(operation, call).await
    }

    pub async fn get_balance(&self, address: Address) -> LoadResult<U256> {
        self.retry_on_timeout("get_balance", || self.node.get_balance(address))
            .await
    }

    /// On-chain transaction count, used to seed imported accounts
    pub async fn get_nonce(&self, address: Address) -> LoadResult<u64> {
        self.retry_on_timeout("get_nonce", || self.node.get_transaction_count(address))
            .await
    }

    /// Block by number or tag; `None` if the node does not have it yet
    pub async fn get_block(&self, block: BlockNumber) -> LoadResult<Option<Block<H256>>> {
        self.retry_on_timeout("get_block", || self.node.get_block(block))
            .await
    }

    /// Current chain head
    pub async fn get_latest_block(&self) -> LoadResult<Block<H256>> {
        self.get_block(BlockNumber::Latest)
            .await?
            .ok_or_else(|| LoadError::Rpc {
                method: "eth_getBlockByNumber",
                message: "node returned no latest block".to_string(),
            })
    }

    /// Poll every `poll_interval` until block `number` exists
    pub async fn get_block_wait(&self, number: u64, poll_interval: Duration) -> LoadResult<Block<H256>> {
        loop {
            if let Some(block) = self.get_block(BlockNumber::Number(number.into())).await? {
                if block.number.is_some() {
                    return Ok(block);
                }
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    pub async fn get_transaction(&self, hash: H256) -> LoadResult<Option<Transaction>> {
        self.retry_on_timeout("get_transaction", || self.node.get_transaction(hash))
            .await
    }

    pub async fn get_transaction_receipt(&self, hash: H256) -> LoadResult<Option<TransactionReceipt>> {
        self.retry_on_timeout("get_transaction_receipt", || {
            self.node.get_transaction_receipt(hash)
        })
        .await
    }

    /// Poll every `poll_interval` until the transaction is mined
    pub async fn wait_for_receipt(
        &self,
        hash: H256,
        poll_interval: Duration,
    ) -> LoadResult<TransactionReceipt> {
        loop {
            if let Some(receipt) = self.get_transaction_receipt(hash).await? {
                if receipt.block_number.is_some() {
                    return Ok(receipt);
                }
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Transfer native currency
    pub async fn send_ether(
        &self,
        from: &Account,
        nonce: u64,
        to: Address,
        value: U256,
        gas_price: U256,
        gas_limit: u64,
    ) -> LoadResult<SentTx> {
        let request = self.base_request(from, nonce, gas_limit).to(to).value(value);
        self.send(from, request, gas_price).await
    }

    /// Transfer `value` units of the load token
    pub async fn send_tokens(
        &self,
        from: &Account,
        nonce: u64,
        to: Address,
        value: U256,
        gas_price: U256,
        gas_limit: u64,
    ) -> LoadResult<SentTx> {
        let request = self
            .base_request(from, nonce, gas_limit)
            .to(self.token)
            .data(transfer_calldata(to, value));
        self.send(from, request, gas_price).await
    }

    fn base_request(&self, from: &Account, nonce: u64, gas_limit: u64) -> TransactionRequest {
        TransactionRequest::new()
            .from(from.address())
            .nonce(nonce)
            .gas(gas_limit)
            .chain_id(self.chain_id)
    }

    /// Send with the configured rejection policy
    async fn send(&self, from: &Account, request: TransactionRequest, gas_price: U256) -> LoadResult<SentTx> {
        match self.sign_and_send(from, &request, gas_price).await {
            Err(e) if e.is_rejection() && !e.is_insufficient_funds() && !e.is_nonce_consumed() => {
                match self.policy.underpriced_gas_bump_wei {
                    Some(bump) => {
                        let bumped = bump_gas_price(gas_price, bump);
                        warn!(
                            "Send from {:?} rejected ({}), retrying with gas price {}",
                            from.address(),
                            e,
                            bumped
                        );
                        let hash = self.sign_and_send(from, &request, bumped).await?;
                        Ok(SentTx {
                            hash,
                            gas_price: bumped,
                        })
                    }
                    None => Err(e),
                }
            }
            result => result.map(|hash| SentTx { hash, gas_price }),
        }
    }

    async fn sign_and_send(
        &self,
        from: &Account,
        request: &TransactionRequest,
        gas_price: U256,
    ) -> LoadResult<H256> {
        let tx: TypedTransaction = request.clone().gas_price(gas_price).into();
        let signature = from
            .wallet()
            .sign_transaction_sync(&tx)
            .map_err(|e| LoadError::Signing(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);
        let local_hash = tx.hash(&signature);

        match self
            .retry_on_timeout("send_raw_transaction", || {
                self.node.send_raw_transaction(raw.clone())
            })
            .await
        {
            // an earlier attempt reached the node before timing out
            Err(e) if e.is_already_known() => {
                debug!("Transaction {:?} already known to node", local_hash);
                Ok(local_hash)
            }
            result => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockNodeClient;
    use crate::tx::AccountLedger;
    use ethers::utils::rlp::Rlp;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    impl CapturedLogs {
        fn lines_containing(&self, needle: &str) -> usize {
            let bytes = self.0.lock().unwrap().clone();
            String::from_utf8(bytes)
                .unwrap()
                .lines()
                .filter(|l| l.contains(needle))
                .count()
        }
    }

    fn timeout(method: &str) -> LoadError {
        LoadError::Timeout {
            operation: method.to_string(),
        }
    }

    fn rejected(message: &str) -> LoadError {
        LoadError::Rejected {
            method: "eth_sendRawTransaction",
            code: -32000,
            message: message.to_string(),
        }
    }

    fn gateway(node: MockNodeClient, policy: SendPolicy) -> RpcGateway {
        RpcGateway::new(
            Arc::new(node),
            1337,
            Address::from_low_u64_be(0xaa),
            Duration::ZERO,
            policy,
        )
    }

    fn signed_gas_price(raw: &Bytes) -> U256 {
        let (tx, _) = TypedTransaction::decode_signed(&Rlp::new(raw)).unwrap();
        tx.gas_price().unwrap()
    }

    #[tokio::test]
    async fn test_balance_retries_timeouts_then_returns() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let calls = AtomicUsize::new(0);
        let mut node = MockNodeClient::new();
        node.expect_get_balance().times(3).returning(move |_| {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(timeout("eth_getBalance"))
            } else {
                Ok(U256::from(1234))
            }
        });

        let gateway = gateway(node, SendPolicy::default());
        let balance = gateway.get_balance(Address::from_low_u64_be(1)).await;

        tokio_test::assert_ok!(&balance);
        assert_eq!(balance.unwrap(), U256::from(1234));
        assert_eq!(gateway.retries(), 2);
        assert_eq!(logs.lines_containing("retrying"), 2);
    }

    #[tokio::test]
    async fn test_other_errors_propagate_without_retry() {
        let mut node = MockNodeClient::new();
        node.expect_get_transaction_count().times(1).returning(|_| {
            Err(LoadError::Rpc {
                method: "eth_getTransactionCount",
                message: "connection refused".to_string(),
            })
        });

        let gateway = gateway(node, SendPolicy::default());
        let result = gateway.get_nonce(Address::from_low_u64_be(1)).await;

        assert!(matches!(result, Err(LoadError::Rpc { .. })));
        assert_eq!(gateway.retries(), 0);
    }

    #[tokio::test]
    async fn test_already_known_returns_local_hash() {
        let ledger = AccountLedger::with_seed(1337, [9u8; 32]);
        let from = ledger.derive_next().unwrap();

        let sent: Arc<Mutex<Vec<Bytes>>> = Arc::default();
        let captured = sent.clone();
        let calls = AtomicUsize::new(0);
        let mut node = MockNodeClient::new();
        node.expect_send_raw_transaction().times(2).returning(move |raw| {
            captured.lock().unwrap().push(raw);
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(timeout("eth_sendRawTransaction"))
            } else {
                Err(rejected("already known"))
            }
        });

        let gateway = gateway(node, SendPolicy::default());
        let accepted = gateway
            .send_ether(&from, 0, Address::from_low_u64_be(2), U256::from(1), U256::from(1_000_000_000u64), 21_000)
            .await
            .unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent[0], sent[1]);
        assert_eq!(accepted.hash, H256::from(ethers::utils::keccak256(&sent[0])));
        assert_eq!(accepted.gas_price, U256::from(1_000_000_000u64));
    }

    #[tokio::test]
    async fn test_rejection_bumps_gas_price_once() {
        let ledger = AccountLedger::with_seed(1337, [9u8; 32]);
        let from = ledger.derive_next().unwrap();

        let sent: Arc<Mutex<Vec<Bytes>>> = Arc::default();
        let captured = sent.clone();
        let mut node = MockNodeClient::new();
        node.expect_send_raw_transaction().times(2).returning(move |raw| {
            let mut sent = captured.lock().unwrap();
            sent.push(raw);
            if sent.len() == 1 {
                Err(rejected("replacement transaction underpriced"))
            } else {
                Ok(H256::from_low_u64_be(7))
            }
        });

        let policy = SendPolicy {
            underpriced_gas_bump_wei: Some(200_000_000),
        };
        let gateway = gateway(node, policy);
        let accepted = gateway
            .send_tokens(&from, 3, Address::from_low_u64_be(2), U256::one(), U256::from(1_000_000_000u64), 60_000)
            .await
            .unwrap();
        assert_eq!(accepted.hash, H256::from_low_u64_be(7));
        assert_eq!(accepted.gas_price, U256::from(1_200_000_000u64));

        let sent = sent.lock().unwrap();
        assert_eq!(signed_gas_price(&sent[0]), U256::from(1_000_000_000u64));
        assert_eq!(signed_gas_price(&sent[1]), U256::from(1_200_000_000u64));
    }

    #[tokio::test]
    async fn test_rejection_propagates_without_policy() {
        let ledger = AccountLedger::with_seed(1337, [9u8; 32]);
        let from = ledger.derive_next().unwrap();

        let mut node = MockNodeClient::new();
        node.expect_send_raw_transaction()
            .times(1)
            .returning(|_| Err(rejected("transaction underpriced")));

        let gateway = gateway(node, SendPolicy::default());
        let result = gateway
            .send_tokens(&from, 0, Address::from_low_u64_be(2), U256::one(), U256::one(), 60_000)
            .await;
        assert!(matches!(result, Err(LoadError::Rejected { .. })));
    }

    #[tokio::test]
    async fn test_nonce_too_low_is_not_bumped() {
        let ledger = AccountLedger::with_seed(1337, [9u8; 32]);
        let from = ledger.derive_next().unwrap();

        let mut node = MockNodeClient::new();
        node.expect_send_raw_transaction()
            .times(1)
            .returning(|_| Err(rejected("nonce too low")));

        let policy = SendPolicy {
            underpriced_gas_bump_wei: Some(200_000_000),
        };
        let gateway = gateway(node, policy);
        let result = gateway
            .send_ether(&from, 0, Address::from_low_u64_be(2), U256::one(), U256::one(), 21_000)
            .await;
        assert!(result.unwrap_err().is_nonce_consumed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_receipt_polls_until_mined() {
        let calls = AtomicUsize::new(0);
        let mut node = MockNodeClient::new();
        node.expect_get_transaction_receipt().times(3).returning(move |_| {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(None),
                1 => Ok(Some(TransactionReceipt::default())),
                _ => Ok(Some(TransactionReceipt {
                    block_number: Some(U64::from(50)),
                    ..Default::default()
                })),
            }
        });

        let gateway = gateway(node, SendPolicy::default());
        let receipt = gateway
            .wait_for_receipt(H256::from_low_u64_be(1), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(receipt.block_number, Some(U64::from(50)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_block_wait_until_block_exists() {
        let calls = AtomicUsize::new(0);
        let mut node = MockNodeClient::new();
        node.expect_get_block().times(2).returning(move |_| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(None)
            } else {
                Ok(Some(Block {
                    number: Some(U64::from(12)),
                    ..Default::default()
                }))
            }
        });

        let gateway = gateway(node, SendPolicy::default());
        let block = gateway.get_block_wait(12, Duration::from_millis(100)).await.unwrap();
        assert_eq!(block.number, Some(U64::from(12)));
    }

    #[test]
    fn test_transfer_calldata_layout() {
        let data = transfer_calldata(Address::from_low_u64_be(0xbeef), U256::from(5));
        assert_eq!(data.len(), 4 + 32 + 32);
        assert_eq!(&data[..4], &[0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(data[4 + 31 - 1..4 + 32], [0xbe, 0xef]);
        assert_eq!(data[data.len() - 1], 5);
    }
}
