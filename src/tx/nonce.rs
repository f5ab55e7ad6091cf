//! Deterministic load accounts and in-memory nonce tracking
//!
//! Handles:
//! - Account derivation from a per-run seed plus a counter
//! - Atomic read-then-increment nonce allocation
//! - Handing back the most recent nonce when a send is rejected

use crate::error::{LoadError, LoadResult};
use crate::results::AccountRecord;

use dashmap::DashMap;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use sha3::{Digest, Keccak256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Derive key material for the `counter`-th account of a run.
///
/// keccak256(seed || decimal(counter)). Pure, so a run can re-derive its
/// accounts from the seed alone.
pub fn derive_key(seed: &[u8; 32], counter: u64) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(seed);
    hasher.update(counter.to_string().as_bytes());
    hasher.finalize().into()
}

/// A signing account with its next nonce
pub struct Account {
    wallet: LocalWallet,
    /// Next nonce to hand out
    nonce: AtomicU64,
}

impl Account {
    fn new(wallet: LocalWallet, nonce: u64) -> Self {
        Self {
            wallet,
            nonce: AtomicU64::new(nonce),
        }
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    /// Hex-encoded secret key, `0x`-prefixed
    pub fn private_key(&self) -> String {
        format!("0x{}", hex::encode(self.wallet.signer().to_bytes()))
    }

    pub fn wallet(&self) -> &LocalWallet {
        &self.wallet
    }

    /// Next nonce without consuming it
    pub fn peek_nonce(&self) -> u64 {
        self.nonce.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("address", &self.address())
            .field("nonce", &self.peek_nonce())
            .finish()
    }
}

/// Owns every account used in a run
pub struct AccountLedger {
    chain_id: u64,
    seed: [u8; 32],
    /// Accounts derived so far
    counter: AtomicU64,
    accounts: DashMap<Address, Arc<Account>>,
}

impl AccountLedger {
    /// Create a ledger with a fresh random seed
    pub fn new(chain_id: u64) -> Self {
        Self::with_seed(chain_id, rand::random())
    }

    /// Create a ledger that derives from a known seed
    pub fn with_seed(chain_id: u64, seed: [u8; 32]) -> Self {
        Self {
            chain_id,
            seed,
            counter: AtomicU64::new(0),
            accounts: DashMap::new(),
        }
    }

    /// Derive the next account. Fresh accounts start at nonce 0.
    pub fn derive_next(&self) -> LoadResult<Arc<Account>> {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let key = derive_key(&self.seed, counter);
        let wallet = LocalWallet::from_bytes(&key)
            .map_err(|e| LoadError::Signing(format!("Derived key {} is invalid: {}", counter, e)))?
            .with_chain_id(self.chain_id);

        let account = Arc::new(Account::new(wallet, 0));
        self.accounts.insert(account.address(), account.clone());

        debug!("Derived account #{}: {:?}", counter, account.address());
        Ok(account)
    }

    /// Track an existing account (e.g. the funder) starting at `nonce`
    pub fn import(&self, private_key: &str, nonce: u64) -> LoadResult<Arc<Account>> {
        let wallet = private_key
            .parse::<LocalWallet>()
            .map_err(|e| LoadError::Config(format!("Invalid private key: {}", e)))?
            .with_chain_id(self.chain_id);

        let account = Arc::new(Account::new(wallet, nonce));
        self.accounts.insert(account.address(), account.clone());

        debug!("Imported account {:?} at nonce {}", account.address(), nonce);
        Ok(account)
    }

    /// Look up an account by address
    pub fn get(&self, address: &Address) -> LoadResult<Arc<Account>> {
        self.accounts
            .get(address)
            .map(|a| a.clone())
            .ok_or_else(|| LoadError::UnknownAccount {
                address: format!("{:?}", address),
            })
    }

    /// Return the account's current nonce and advance it
    pub fn get_use_nonce(&self, account: &Account) -> u64 {
        account.nonce.fetch_add(1, Ordering::SeqCst)
    }

    /// Hand back `nonce` if it is still the most recently issued one
    pub fn release_nonce(&self, account: &Account, nonce: u64) -> bool {
        let released = account
            .nonce
            .compare_exchange(nonce + 1, nonce, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();

        if released {
            debug!("Released nonce {} for {:?}", nonce, account.address());
        }
        released
    }

    /// Exportable `{private_key, address}` pair
    pub fn to_summary(&self, account: &Account) -> AccountRecord {
        AccountRecord {
            private_key: account.private_key(),
            address: account.address(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const FUNDER_KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    #[test]
    fn test_derivation_is_deterministic() {
        let seed = [7u8; 32];
        assert_eq!(derive_key(&seed, 1), derive_key(&seed, 1));
        assert_ne!(derive_key(&seed, 1), derive_key(&seed, 2));
        assert_ne!(derive_key(&seed, 1), derive_key(&[8u8; 32], 1));

        let a = AccountLedger::with_seed(1, seed);
        let b = AccountLedger::with_seed(1, seed);
        for _ in 0..5 {
            assert_eq!(a.derive_next().unwrap().address(), b.derive_next().unwrap().address());
        }
    }

    #[test]
    fn test_nonces_are_sequential() {
        let ledger = AccountLedger::with_seed(1, [1u8; 32]);
        let account = ledger.derive_next().unwrap();

        let issued: Vec<u64> = (0..10).map(|_| ledger.get_use_nonce(&account)).collect();
        assert_eq!(issued, (0..10).collect::<Vec<_>>());
        assert_eq!(account.peek_nonce(), 10);
    }

    #[test]
    fn test_concurrent_nonce_allocation_has_no_repeats() {
        let ledger = AccountLedger::with_seed(1, [2u8; 32]);
        let account = ledger.derive_next().unwrap();

        let mut issued: Vec<u64> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| (0..250).map(|_| ledger.get_use_nonce(&account)).collect::<Vec<_>>()))
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        let unique: HashSet<u64> = issued.iter().copied().collect();
        assert_eq!(unique.len(), issued.len());

        issued.sort_unstable();
        assert_eq!(issued, (0..2000).collect::<Vec<_>>());
    }

    #[test]
    fn test_release_only_latest_nonce() {
        let ledger = AccountLedger::with_seed(1, [3u8; 32]);
        let account = ledger.derive_next().unwrap();

        let first = ledger.get_use_nonce(&account);
        let second = ledger.get_use_nonce(&account);
        assert!(!ledger.release_nonce(&account, first));
        assert!(ledger.release_nonce(&account, second));
        assert_eq!(ledger.get_use_nonce(&account), second);
    }

    #[test]
    fn test_import_and_summary() {
        let ledger = AccountLedger::with_seed(1, [4u8; 32]);
        let funder = ledger.import(FUNDER_KEY, 42).unwrap();
        assert_eq!(funder.peek_nonce(), 42);
        assert_eq!(funder.private_key(), FUNDER_KEY);

        let summary = ledger.to_summary(&funder);
        assert_eq!(summary.address, funder.address());
        assert_eq!(ledger.get(&funder.address()).unwrap().address(), funder.address());

        assert!(matches!(
            ledger.get(&Address::zero()),
            Err(LoadError::UnknownAccount { .. })
        ));
        assert!(ledger.import("not a key", 0).is_err());
    }
}
