//! Process-wide shutdown coordination.
//!
//! A [`Supervisor`] owns the root [`CancellationToken`] and a [`TaskTracker`].
//! Every long-lived task (broker observer, workers, signal listener) is
//! spawned through it, so one OS signal stops them all and `main` can block
//! until every one of them has returned.

use std::future::Future;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

#[derive(Debug, Clone, Default)]
pub struct Supervisor {
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The root token. Cancelling it asks every task to stop.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn a tracked task.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Cancel the root token.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Spawn a listener that cancels the root token on SIGINT or SIGTERM.
    ///
    /// The listener itself exits when the token is cancelled for any other
    /// reason, so it never keeps [`Supervisor::wait`] from returning.
    pub fn watch_signals(&self) {
        let cancel = self.token();
        self.spawn(async move {
            let ctrl_c = async {
                if let Err(e) = signal::ctrl_c().await {
                    error!(error = %e, "Failed to install Ctrl+C handler");
                    std::future::pending::<()>().await;
                }
            };

            #[cfg(unix)]
            let terminate = async {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut sig) => {
                        sig.recv().await;
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
                _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
                _ = terminate => info!("Received terminate signal, shutting down"),
                _ = cancel.cancelled() => return,
            }
            cancel.cancel();
        });
    }

    /// Close the tracker and wait until every spawned task has exited.
    ///
    /// Tasks may still be spawned while waiting (the broker observer
    /// re-installs itself), so the tracker is closed first and then drained.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}
