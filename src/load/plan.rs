//! Load schedule generation

use crate::config::LoadConfig;
use crate::error::{LoadError, LoadResult};
use crate::results::PlannedTransfer;
use crate::tx::Account;

use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use tracing::info;

/// Build the full list of load transfers before any funding happens.
///
/// The schedule holds `test_duration_secs * tx_per_sec` transfers. When that
/// equals the account count every account sends exactly once, senders taken
/// from the end of the list; otherwise senders are drawn at random.
/// Recipients are always random.
pub fn plan_transfers<R: Rng + ?Sized>(
    config: &LoadConfig,
    accounts: &[Arc<Account>],
    rng: &mut R,
) -> LoadResult<Vec<PlannedTransfer>> {
    if accounts.is_empty() {
        return Err(LoadError::Config("cannot plan transfers without accounts".to_string()));
    }

    let total = config.total_transactions();
    let one_per_account = accounts.len() == total;

    let mut transfers = Vec::with_capacity(total);
    for i in 0..total {
        let from = if one_per_account {
            &accounts[accounts.len() - 1 - i]
        } else {
            pick(accounts, rng)?
        };
        let to = pick(accounts, rng)?;

        transfers.push(PlannedTransfer {
            from: from.address(),
            to: to.address(),
        });
    }

    info!(
        "Planned {} transfers over {} accounts ({})",
        transfers.len(),
        accounts.len(),
        if one_per_account { "one per account" } else { "random senders" }
    );

    Ok(transfers)
}

fn pick<'a, R: Rng + ?Sized>(accounts: &'a [Arc<Account>], rng: &mut R) -> LoadResult<&'a Arc<Account>> {
    accounts
        .choose(rng)
        .ok_or_else(|| LoadError::Internal("account list emptied while planning".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::test_load_config;
    use crate::tx::AccountLedger;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    fn accounts(n: usize) -> Vec<Arc<Account>> {
        let ledger = AccountLedger::with_seed(1, [5u8; 32]);
        (0..n).map(|_| ledger.derive_next().unwrap()).collect()
    }

    #[test]
    fn test_one_transfer_per_account() {
        let config = test_load_config(10, 2, 20);
        let accounts = accounts(20);
        let mut rng = StdRng::seed_from_u64(1);

        let transfers = plan_transfers(&config, &accounts, &mut rng).unwrap();
        assert_eq!(transfers.len(), 20);

        let mut senders: HashMap<_, usize> = HashMap::new();
        for t in &transfers {
            *senders.entry(t.from).or_default() += 1;
        }
        assert_eq!(senders.len(), 20);
        assert!(senders.values().all(|&n| n == 1));
        assert_eq!(transfers[0].from, accounts[19].address());
    }

    #[test]
    fn test_random_senders_stay_within_accounts() {
        let config = test_load_config(6, 2, 5);
        let accounts = accounts(5);
        let known: Vec<_> = accounts.iter().map(|a| a.address()).collect();
        let mut rng = StdRng::seed_from_u64(2);

        let transfers = plan_transfers(&config, &accounts, &mut rng).unwrap();
        assert_eq!(transfers.len(), 12);
        assert!(transfers.iter().all(|t| known.contains(&t.from) && known.contains(&t.to)));

        let again = plan_transfers(&config, &accounts, &mut StdRng::seed_from_u64(2)).unwrap();
        assert_eq!(transfers, again);
    }

    #[test]
    fn test_no_accounts() {
        let config = test_load_config(1, 1, 1);
        let mut rng = StdRng::seed_from_u64(3);
        assert!(matches!(
            plan_transfers(&config, &[], &mut rng),
            Err(LoadError::Config(_))
        ));
    }
}
