//! Periodic sweep for payouts deferred on insufficient available balance.
//! Without it a deferred intent waits for an operator.

use super::fulfillment::{FulfillmentService, PayoutStep};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct PayoutRetrier {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PayoutRetrier {
    /// Starts the sweep loop on the current runtime.
    pub fn spawn(service: Arc<FulfillmentService>, interval: Duration) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "deferred payout sweep started");
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match service.retry_deferred_payouts().await {
                            Ok(steps) if steps.is_empty() => debug!("no deferred payouts"),
                            Ok(steps) => {
                                let created = steps
                                    .iter()
                                    .filter(|(_, step)| matches!(step, PayoutStep::Created { .. }))
                                    .count();
                                info!(retried = steps.len(), created, "deferred payouts retried");
                            }
                            Err(e) => warn!(error = %e, "deferred payout sweep failed"),
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("deferred payout sweep stopped");
        });

        Self { shutdown, handle }
    }

    /// Signals the loop to exit and waits for it.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "deferred payout sweep ended abnormally");
        }
    }
}
