//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! Ensures that:
//! - Watchers and pending sweeps stop first
//! - Checks already waiting on a remote operation are allowed to finish
//! - The executor stops last, abandoning tasks it never started

use crate::engine::ReconciliationEngine;
use crate::executor::TaskExecutor;
use std::time::Duration;
use tokio::signal;
use tracing::info;

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    grace: Duration,
}

impl ShutdownCoordinator {
    /// `grace` bounds each drain step
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Wait for shutdown signal (SIGTERM or SIGINT)
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
    }

    /// Drain the engine, then the executor that resolves its tasks
    pub async fn shutdown(&self, engine: &ReconciliationEngine, executor: TaskExecutor) {
        info!("Graceful shutdown initiated");

        engine.shutdown(self.grace).await;
        executor.shutdown(self.grace).await;

        info!("Graceful shutdown complete");
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
