//! Unlimited retry of transport timeouts
//!
//! Shared by the node gateway and the gas price oracle reads. A timed-out
//! call is logged, counted and repeated after a fixed sleep; every other
//! outcome is handed back to the caller.

use crate::error::LoadResult;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;

pub struct TimeoutRetry {
    delay: Duration,
    /// Timeouts retried so far
    retries: AtomicU64,
}

impl TimeoutRetry {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            retries: AtomicU64::new(0),
        }
    }

    /// Number of timed-out calls that have been retried
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Run `call` until it returns something other than a transient timeout
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut call: F) -> LoadResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LoadResult<T>>,
    {
        loop {
            match call().await {
                Err(e) if e.is_transient() => {
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_rpc_retry(operation);
                    warn!("timeout in {} ({}), retrying", operation, e);
                    tokio::time::sleep(self.delay).await;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoadError;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_retries_only_timeouts() {
        let retry = TimeoutRetry::new(Duration::from_millis(100));
        let calls = AtomicUsize::new(0);

        let value = retry
            .run("eth_blockNumber", || async {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err(LoadError::Timeout {
                        operation: "eth_blockNumber".into(),
                    }),
                    _ => Ok(7u64),
                }
            })
            .await;
        tokio_test::assert_ok!(&value);
        assert_eq!(value.unwrap(), 7);
        assert_eq!(retry.retries(), 2);

        let failed: LoadResult<u64> = retry
            .run("eth_blockNumber", || async { Err(LoadError::Oracle("bad gateway".into())) })
            .await;
        assert!(matches!(failed, Err(LoadError::Oracle(_))));
        assert_eq!(retry.retries(), 2);
    }
}
