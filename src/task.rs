//! Background task lifecycle

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A spawned monitor loop and the token that stops it.
///
/// Stopping is cooperative: the loop finishes its current iteration
/// (in-flight RPC calls are not aborted) and exits at its next sleep.
pub struct MonitorTask {
    name: &'static str,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl MonitorTask {
    pub fn new(name: &'static str, token: CancellationToken, handle: JoinHandle<()>) -> Self {
        Self { name, token, handle }
    }

    /// Signal the loop to stop and wait for it to exit
    pub async fn stop(self) {
        self.token.cancel();
        match self.handle.await {
            Ok(()) => debug!("{} stopped", self.name),
            Err(e) => warn!("{} exited abnormally: {}", self.name, e),
        }
    }
}
