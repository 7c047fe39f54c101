//! Graceful shutdown coordination.
//!
//! A [`ShutdownSignal`] is cloned into every long-running component (the
//! HTTP server, each consumer processor). Once triggered, by SIGINT/SIGTERM
//! or programmatically, components stop taking new work and let in-flight
//! work reach its end.
//!
//! # Example
//!
//! ```rust,ignore
//! use touchline::shutdown::ShutdownSignal;
//!
//! #[tokio::main]
//! async fn main() {
//!     let shutdown = ShutdownSignal::new();
//!
//!     // Translate OS signals into a trigger
//!     tokio::spawn(shutdown.clone().listen_for_signals());
//!
//!     let worker_shutdown = shutdown.clone();
//!     tokio::spawn(async move {
//!         loop {
//!             tokio::select! {
//!                 _ = worker_shutdown.cancelled() => break,
//!                 // ... receive messages
//!             }
//!         }
//!     });
//! }
//! ```

use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Default shutdown timeout in seconds.
const DEFAULT_SHUTDOWN_TIMEOUT: u64 = 30;

/// A level-triggered signal for coordinating graceful shutdown.
///
/// Unlike an edge notification, a clone created or polled after the trigger
/// still observes it.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: watch::Sender<bool>,
    receiver: watch::Receiver<bool>,
    /// How long components get to finish after the trigger
    timeout: Duration,
}

impl ShutdownSignal {
    /// Create a new shutdown signal with default timeout (30 seconds).
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT))
    }

    /// Create a new shutdown signal with custom timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender,
            receiver,
            timeout,
        }
    }

    /// Get the shutdown timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for SIGINT or SIGTERM, then trigger.
    pub async fn listen_for_signals(self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.cancelled() => return,
        }

        self.sender.send_replace(true);
    }

    /// Resolve once shutdown has been triggered.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // Err means every sender is gone, which cannot happen while `self` lives.
        let _ = receiver.wait_for(|triggered| *triggered).await;
    }

    /// Non-blocking check.
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Trigger shutdown manually (for testing or programmatic shutdown).
    pub fn trigger(&self) {
        info!("Shutdown triggered programmatically");
        self.sender.send_replace(true);
    }

    /// Wait for `task` to finish, giving up after the shutdown timeout.
    ///
    /// Returns `None` if the timeout was reached.
    pub async fn drain<F: std::future::Future>(&self, task: F) -> Option<F::Output> {
        match tokio::time::timeout(self.timeout, task).await {
            Ok(output) => Some(output),
            Err(_) => {
                warn!(
                    timeout_secs = self.timeout.as_secs(),
                    "Shutdown timeout reached, forcing shutdown"
                );
                None
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
