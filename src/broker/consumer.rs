//! Pulling deliveries from a queue.

use super::connection::Connection;
use crate::error::{BrokerError, IngestError};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Handles the body of one delivery.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, cancel: &CancellationToken, body: &[u8]) -> Result<(), IngestError>;
}

pub struct Consumer {
    conn: Arc<Connection>,
    handler: Arc<dyn DeliveryHandler>,
    auto_ack: bool,
}

impl Consumer {
    pub fn new(conn: Arc<Connection>, handler: Arc<dyn DeliveryHandler>, auto_ack: bool) -> Self {
        Self {
            conn,
            handler,
            auto_ack,
        }
    }

    /// Consume `queue` until cancelled or until the stream ends.
    ///
    /// Deliveries are handled one at a time. With manual ack each delivery
    /// is acknowledged once the handler returns, whether it succeeded or not;
    /// handler errors are only logged.
    ///
    /// # Returns
    ///
    /// - `Ok(())` when `cancel` fires
    /// - [`BrokerError::StreamClosed`] when the broker ends the stream
    /// - any error from opening the stream
    #[instrument(level = "info", skip(self, cancel))]
    pub async fn consume(&self, cancel: &CancellationToken, queue: &str) -> Result<(), BrokerError> {
        let channel = self.conn.channel().await?;
        let mut deliveries = channel.consume(queue, self.auto_ack).await?;
        info!(auto_ack = self.auto_ack, "Consuming");

        loop {
            let next = tokio::select! {
                next = deliveries.next() => next,
                _ = cancel.cancelled() => return Ok(()),
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    warn!(error = %e, "Delivery stream failed");
                    return Err(if cancel.is_cancelled() {
                        BrokerError::Cancelled
                    } else {
                        e
                    });
                }
                None if cancel.is_cancelled() => return Ok(()),
                None => return Err(BrokerError::StreamClosed),
            };

            debug!(bytes = delivery.body.len(), "Delivery received");
            if let Err(e) = self.handler.handle(cancel, &delivery.body).await {
                if e.is_cancelled() {
                    debug!("Handler cancelled");
                } else {
                    error!(error = %e, "Delivery handler failed");
                }
            }
            if let Err(e) = delivery.ack().await {
                warn!(error = %e, "Failed to acknowledge delivery");
            }
        }
    }
}
