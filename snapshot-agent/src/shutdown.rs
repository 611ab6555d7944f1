//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! A signal cancels the shared token, which stops rsync and the drain worker
//! and leaves `latest` as-is for the next run.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token cancelled once a shutdown signal arrives
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for SIGINT or SIGTERM, then cancel the token
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), cancelling...");
            }
            _ = terminate => {
                info!("Received SIGTERM, cancelling...");
            }
            _ = self.token.cancelled() => return,
        }

        self.token.cancel();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_coordinator() {
        let coordinator = ShutdownCoordinator::new();
        let token = coordinator.token();

        let handle = tokio::spawn(async move {
            token.cancelled().await;
        });

        coordinator.token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_signal_returns_when_cancelled_elsewhere() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.token().cancel();
        tokio::time::timeout(Duration::from_secs(1), coordinator.wait_for_signal())
            .await
            .unwrap();
    }
}
