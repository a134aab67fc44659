//! Query-driven search.
//!
//! Every worker owns a queue bound to the fanout query exchange, so one
//! published query reaches every running worker. Each delivery body is a
//! plain UTF-8 query string.

use super::pause;
use crate::broker::connection::Connection;
use crate::broker::consumer::{Consumer, DeliveryHandler};
use crate::error::{IngestError, ParseError};
use crate::ingest::IngestService;
use crate::models::ParseRequest;
use crate::utils::truncate_for_log;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

pub const DEFAULT_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// Runs one search per delivery.
pub struct SearchHandler {
    service: Arc<IngestService>,
}

impl SearchHandler {
    pub fn new(service: Arc<IngestService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl DeliveryHandler for SearchHandler {
    async fn handle(&self, cancel: &CancellationToken, body: &[u8]) -> Result<(), IngestError> {
        let query = std::str::from_utf8(body)
            .map_err(|e| ParseError::InvalidQuery(format!("not valid UTF-8: {e}")))?;

        let report = self
            .service
            .parse(cancel, &ParseRequest::query(query))
            .await?;
        info!(
            role = "search",
            query = %truncate_for_log(query, 120),
            count = report.count,
            "Search finished"
        );
        Ok(())
    }
}

/// The Search role's consumer. Deliveries are acked manually once the
/// search has run, so a query survives a crash mid-search.
pub fn search_consumer(conn: Arc<Connection>, service: Arc<IngestService>) -> Consumer {
    Consumer::new(conn, Arc::new(SearchHandler::new(service)), false)
}

pub struct SearchWorker {
    consumer: Consumer,
    queue: String,
    resubscribe_delay: Duration,
}

impl SearchWorker {
    pub fn new(consumer: Consumer, queue: impl Into<String>, resubscribe_delay: Duration) -> Self {
        Self {
            consumer,
            queue: queue.into(),
            resubscribe_delay,
        }
    }

    /// Consume until cancelled, re-subscribing after every stream failure.
    ///
    /// Re-subscribing only opens a new consumer on the current channel; the
    /// connection itself is redialed by its own observer.
    #[instrument(level = "info", skip_all, fields(role = "search", queue = %self.queue))]
    pub async fn run(self, cancel: CancellationToken) {
        let mut delay = Duration::ZERO;
        while pause(&cancel, delay).await {
            match self.consumer.consume(&cancel, &self.queue).await {
                Ok(()) => break,
                Err(e) if e.is_cancelled() => break,
                Err(e) => warn!(error = %e, delay = ?self.resubscribe_delay, "Search consumer stopped; re-subscribing"),
            }
            delay = self.resubscribe_delay;
        }
        info!("Worker stopped");
    }
}
