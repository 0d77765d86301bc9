//! Optional background warm-up that keeps the supplier token fresh between
//! orders. Request paths never rely on it: `get_valid_token` refreshes lazily.

use super::credentials::CredentialStore;
use crate::errors::ServiceError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct TokenRefresher {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TokenRefresher {
    /// Starts the warm-up loop on the current runtime.
    pub fn spawn(store: Arc<CredentialStore>, interval: Duration) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "supplier token warm-up started");
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.get_valid_token().await {
                            Ok(token) => debug!(expires_at = %token.expires_at, "supplier token warm"),
                            Err(ServiceError::NotConnected) => {
                                debug!("supplier account not connected; nothing to warm")
                            }
                            Err(e) => warn!(error = %e, "supplier token warm-up failed"),
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("supplier token warm-up stopped");
        });

        Self { shutdown, handle }
    }

    /// Signals the loop to exit and waits for it.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "supplier token warm-up task ended abnormally");
        }
    }
}
