//! Periodic expiry sweep

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::Portal;

/// Runs [`Portal::sweep`] on a fixed interval until shut down
#[derive(Debug)]
pub struct Sweeper {
    portal: Arc<Portal>,
    interval: Duration,
}

impl Sweeper {
    #[must_use]
    pub fn new(portal: Arc<Portal>, interval: Duration) -> Self {
        Self { portal, interval }
    }

    /// Sweep every `interval` until `shutdown_rx` fires or its sender is dropped
    pub async fn run_until_shutdown(self, mut shutdown_rx: oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        info!(interval_secs = self.interval.as_secs(), "Session sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let expired = self.portal.sweep().await;
                    debug!(expired = expired.len(), remaining = self.portal.authority().len(), "Sweep complete");
                }
                _ = &mut shutdown_rx => {
                    info!("Session sweeper received shutdown signal");
                    break;
                }
            }
        }
    }
}
