//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! Cancelling the shared token stops the reconciliation loop, the health
//! server, and every replication poller. In-flight replication jobs are
//! owned by the storage service and keep running; holds reconcile them on
//! the next startup.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct ShutdownCoordinator {
    cancel: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
        }
    }

    /// Token handed to every task that must stop on shutdown
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for SIGINT or SIGTERM, then cancel the shared token
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }

        self.cancel.cancel();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
