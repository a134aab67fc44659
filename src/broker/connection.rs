//! A broker connection that survives server restarts.
//!
//! [`Connection::open`] dials with a bounded number of attempts and fails
//! fast if the broker never comes up. Once open, a background observer waits
//! on the session's fault feed and, when it fires, redials at a fixed delay
//! until it succeeds or the process shuts down. Producers and consumers fetch
//! the current channel on every call, so a swap is invisible to them except
//! as one failed in-flight operation.
//!
//! ```text
//! Closed -> Connecting -> Open -> Reconnecting -> Open ... -> Closed
//! ```

use super::{BrokerChannel, Dialer, Session, Topology};
use crate::error::BrokerError;
use crate::supervisor::Supervisor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Reconnecting,
}

/// Retry policy for the initial dial and for reconnects.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    /// Number of dial attempts made by [`Connection::open`].
    pub attempt_count: usize,
    /// Pause between attempts, both initially and while reconnecting.
    pub attempt_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            attempt_count: 5,
            attempt_delay: Duration::from_secs(10),
        }
    }
}

pub struct Connection {
    dialer: Arc<dyn Dialer>,
    config: ConnectionConfig,
    topology: Topology,
    channel: RwLock<Option<Arc<dyn BrokerChannel>>>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

impl Connection {
    /// Dial the broker, declare `topology` and start the reconnect observer.
    ///
    /// # Arguments
    ///
    /// * `supervisor` - Owner of the root token; the observer is tracked by it
    /// * `dialer` - How to reach the broker
    /// * `config` - Attempt count and delay
    /// * `topology` - Declared after every successful dial
    ///
    /// # Errors
    ///
    /// - [`BrokerError::InvalidAddress`] before any network traffic
    /// - [`BrokerError::Cancelled`] if the root token fires while retrying
    /// - [`BrokerError::Exhausted`] once every attempt has failed
    #[instrument(level = "info", skip_all, fields(role = "broker"))]
    pub async fn open(
        supervisor: &Supervisor,
        dialer: Arc<dyn Dialer>,
        config: ConnectionConfig,
        topology: Topology,
    ) -> Result<Arc<Self>, BrokerError> {
        dialer.validate()?;

        let (state, _) = watch::channel(ConnectionState::Connecting);
        let conn = Arc::new(Self {
            dialer,
            config,
            topology,
            channel: RwLock::new(None),
            state,
            cancel: supervisor.token().child_token(),
        });

        let attempts = config.attempt_count.max(1);
        let mut attempt = 0usize;
        let faults = loop {
            attempt += 1;
            match conn.establish().await {
                Ok(faults) => break faults,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) if attempt >= attempts => {
                    error!(attempt, error = %e, "Broker unreachable; giving up");
                    conn.state.send_replace(ConnectionState::Closed);
                    return Err(BrokerError::Exhausted {
                        attempts,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    warn!(
                        attempt,
                        left = attempts - attempt,
                        delay = ?config.attempt_delay,
                        error = %e,
                        "Broker connection attempt failed"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(config.attempt_delay) => {}
                        _ = conn.cancel.cancelled() => return Err(BrokerError::Cancelled),
                    }
                }
            }
        };

        conn.state.send_replace(ConnectionState::Open);
        info!(attempt, "Broker connection open");

        supervisor.spawn(Arc::clone(&conn).observe(faults));
        Ok(conn)
    }

    /// The current channel, or [`BrokerError::NotConnected`] while there is
    /// none (reconnecting or closed).
    pub async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        self.channel
            .read()
            .await
            .clone()
            .ok_or(BrokerError::NotConnected)
    }

    /// Resolves once the connection is closed or the root token fires.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Close the channel and connection and stop the observer.
    ///
    /// Safe to call more than once; later calls are no-ops.
    #[instrument(level = "info", skip_all, fields(role = "broker"))]
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.cancel.cancel();
        let channel = self.channel.write().await.take();
        self.state.send_replace(ConnectionState::Closed);
        match channel {
            Some(ch) => {
                let res = ch.close().await;
                match &res {
                    Ok(()) => info!("Broker connection closed"),
                    Err(e) => warn!(error = %e, "Error while closing broker connection"),
                }
                res
            }
            None => Ok(()),
        }
    }

    /// Dial once, declare the topology and install the new channel.
    async fn establish(&self) -> Result<oneshot::Receiver<BrokerError>, BrokerError> {
        let Session { channel, faults } = tokio::select! {
            res = self.dialer.dial() => res?,
            _ = self.cancel.cancelled() => return Err(BrokerError::Cancelled),
        };

        if let Err(e) = channel.declare(&self.topology).await {
            let _ = channel.close().await;
            return Err(e);
        }

        let mut slot = self.channel.write().await;
        if self.cancel.is_cancelled() {
            drop(slot);
            let _ = channel.close().await;
            return Err(BrokerError::Cancelled);
        }
        *slot = Some(channel);
        Ok(faults)
    }

    /// Wait for session faults and reconnect after each one.
    async fn observe(self: Arc<Self>, mut faults: oneshot::Receiver<BrokerError>) {
        loop {
            let cause = tokio::select! {
                res = &mut faults => match res {
                    Ok(e) => e,
                    Err(_) => BrokerError::Transport("fault feed dropped".into()),
                },
                _ = self.cancel.cancelled() => return,
            };

            warn!(role = "broker", error = %cause, "Broker connection lost; reconnecting");
            let dead = self.channel.write().await.take();
            self.state.send_replace(ConnectionState::Reconnecting);
            if let Some(ch) = dead {
                let _ = ch.close().await;
            }

            let mut attempt = 0usize;
            faults = loop {
                attempt += 1;
                match self.establish().await {
                    Ok(f) => break f,
                    Err(e) if e.is_cancelled() => return,
                    Err(e) => {
                        warn!(
                            role = "broker",
                            attempt,
                            delay = ?self.config.attempt_delay,
                            error = %e,
                            "Broker reconnect failed"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(self.config.attempt_delay) => {}
                            _ = self.cancel.cancelled() => return,
                        }
                    }
                }
            };

            self.state.send_replace(ConnectionState::Open);
            info!(role = "broker", attempt, "Broker connection restored");
        }
    }
}
