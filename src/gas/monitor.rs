//! Background gas price polling

use super::{wei_to_gwei, GasOracle};
use crate::error::LoadResult;
use crate::retry::TimeoutRetry;
use crate::task::MonitorTask;

use ethers::types::U256;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Read side of the published gas price
#[derive(Clone)]
pub struct GasPriceHandle {
    rx: watch::Receiver<U256>,
}

impl GasPriceHandle {
    pub(crate) fn new(rx: watch::Receiver<U256>) -> Self {
        Self { rx }
    }

    /// Most recently published price in wei. Never blocks the writer.
    pub fn get_latest_gas_price(&self) -> U256 {
        *self.rx.borrow()
    }
}

/// Polls one oracle tier and publishes changes
pub struct GasPriceMonitor {
    oracle: Arc<dyn GasOracle>,
    tier: String,
    interval: Duration,
    tx: watch::Sender<U256>,
}

impl GasPriceMonitor {
    /// Create a monitor seeded with a first oracle reading.
    ///
    /// The first reading is retried through timeouts and must otherwise
    /// succeed; later failures keep the last value.
    pub async fn new(
        oracle: Arc<dyn GasOracle>,
        tier: impl Into<String>,
        interval: Duration,
        retry: &TimeoutRetry,
    ) -> LoadResult<Self> {
        let tier = tier.into();
        let initial = retry
            .run("oracle_gas_price", || oracle.gas_price(&tier))
            .await?;
        info!("Initial {} gas price: {} gwei", tier, wei_to_gwei(initial));
        crate::metrics::record_gas_price(&tier, wei_to_gwei(initial));

        let (tx, _) = watch::channel(initial);
        Ok(Self {
            oracle,
            tier,
            interval,
            tx,
        })
    }

    pub fn handle(&self) -> GasPriceHandle {
        GasPriceHandle::new(self.tx.subscribe())
    }

    pub fn get_latest_gas_price(&self) -> U256 {
        *self.tx.borrow()
    }

    /// Fetch once and publish if the price changed
    pub async fn poll_once(&self) {
        match self.oracle.gas_price(&self.tier).await {
            Ok(price) => {
                let current = self.get_latest_gas_price();
                if price != current {
                    info!(
                        "{} gas price change: {} -> {} gwei",
                        self.tier,
                        wei_to_gwei(current),
                        wei_to_gwei(price)
                    );
                    self.tx.send_replace(price);
                    crate::metrics::record_gas_price(&self.tier, wei_to_gwei(price));
                } else {
                    info!("{} gas price unchanged: {} gwei", self.tier, wei_to_gwei(current));
                }
            }
            Err(e) => {
                warn!("Failed to fetch {} gas price, keeping last value: {}", self.tier, e);
            }
        }
    }

    /// Polling loop; exits when `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Starting {} gas price updates every {:?}", self.tier, self.interval);

        loop {
            self.poll_once().await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("{} gas price updates stopped", self.tier);
    }

    /// Start the loop on the runtime; returns the read handle and the task
    pub fn spawn(self) -> (GasPriceHandle, MonitorTask) {
        let handle = self.handle();
        let token = CancellationToken::new();
        let join = tokio::spawn(self.run(token.clone()));
        (handle, MonitorTask::new("gas price monitor", token, join))
    }
}
