//! Publishing with a bounded timeout.

use super::Message;
use super::connection::Connection;
use crate::error::BrokerError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Something messages can be published through.
///
/// The ingestion service depends on this trait rather than on [`Producer`]
/// so it can be exercised against an in-memory double.
#[async_trait]
pub trait Publish: Send + Sync {
    async fn produce(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<(), BrokerError>;
}

/// Publishes through the current channel of a [`Connection`].
pub struct Producer {
    conn: Arc<Connection>,
    timeout: Duration,
}

impl Producer {
    /// # Arguments
    ///
    /// * `conn` - The shared connection; its channel is re-fetched per call
    /// * `timeout` - Upper bound for one publish. `Duration::ZERO` disables
    ///   it; closing the connection or shutting down still aborts the call.
    pub fn new(conn: Arc<Connection>, timeout: Duration) -> Self {
        Self { conn, timeout }
    }
}

#[async_trait]
impl Publish for Producer {
    #[instrument(level = "debug", skip(self, message), fields(bytes = message.body.len()))]
    async fn produce(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<(), BrokerError> {
        let channel = self.conn.channel().await?;
        let publish = channel.publish(exchange, routing_key, &message);

        let bounded = async {
            if self.timeout.is_zero() {
                publish.await
            } else {
                tokio::time::timeout(self.timeout, publish)
                    .await
                    .map_err(|_| BrokerError::Timeout(self.timeout))?
            }
        };
        tokio::select! {
            res = bounded => res?,
            _ = self.conn.cancelled() => return Err(BrokerError::Cancelled),
        }
        debug!("Message published");
        Ok(())
    }
}
