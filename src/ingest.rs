//! Parse, publish, and buffer what could not be published.
//!
//! [`IngestService::parse`] runs one parser cycle and hands every item to the
//! broker. When a publish fails the serialized item goes to the
//! [`FallbackStore`] instead, so nothing parsed is lost while the broker is
//! away. [`IngestService::release`] later drains that store in arrival order.
//!
//! Delivery is at-least-once: a record is removed from the store only after
//! its publish succeeded, and a crash between the two re-publishes it on the
//! next release. The message id is derived from the payload, so both copies
//! carry the same id.

use crate::broker::Message;
use crate::broker::producer::Publish;
use crate::error::{IngestError, ParseError, ReleaseError};
use crate::models::{ParseRequest, Parsed};
use crate::store::FallbackStore;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Turns a [`ParseRequest`] into news items.
///
/// Implementations must respect `cancel` and may be called repeatedly with
/// the same request.
#[async_trait]
pub trait Parser: Send + Sync {
    async fn parse(
        &self,
        cancel: &CancellationToken,
        request: &ParseRequest,
    ) -> Result<Parsed, ParseError>;
}

/// Outcome of one [`IngestService::parse`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseReport {
    /// Items published or buffered.
    pub count: usize,
    pub next_page: String,
}

/// Where news items are published.
#[derive(Debug, Clone)]
pub struct Route {
    pub exchange: String,
    pub routing_key: String,
}

impl Route {
    /// The default exchange, routed straight to `queue`.
    pub fn queue(queue: impl Into<String>) -> Self {
        Self {
            exchange: String::new(),
            routing_key: queue.into(),
        }
    }
}

pub struct IngestService {
    parser: Option<Arc<dyn Parser>>,
    publisher: Arc<dyn Publish>,
    fallback: Arc<dyn FallbackStore>,
    route: Route,
    app_id: String,
}

impl IngestService {
    /// # Arguments
    ///
    /// * `parser` - `None` for a release-only service
    /// * `publisher` - Usually a [`Producer`](crate::broker::producer::Producer)
    /// * `fallback` - Buffer for items whose publish failed
    /// * `route` - Exchange and routing key for news items
    /// * `app_id` - Stamped on every message; the worker id
    pub fn new(
        parser: Option<Arc<dyn Parser>>,
        publisher: Arc<dyn Publish>,
        fallback: Arc<dyn FallbackStore>,
        route: Route,
        app_id: impl Into<String>,
    ) -> Self {
        Self {
            parser,
            publisher,
            fallback,
            route,
            app_id: app_id.into(),
        }
    }

    fn message(&self, body: Vec<u8>) -> Message {
        let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, &body);
        Message::json(body)
            .with_app_id(self.app_id.clone())
            .with_message_id(id.to_string())
    }

    /// Run the parser once and hand every item to the broker.
    ///
    /// Parser errors propagate untouched. A serialization error aborts the
    /// call. A failed publish buffers the item and moves on; only a failure
    /// to buffer is an error.
    #[instrument(level = "info", skip(self, cancel), fields(query = %request.query, page = %request.page))]
    pub async fn parse(
        &self,
        cancel: &CancellationToken,
        request: &ParseRequest,
    ) -> Result<ParseReport, IngestError> {
        let parser = self.parser.as_ref().ok_or(IngestError::NoParser)?;
        let parsed = parser.parse(cancel, request).await?;

        let mut count = 0usize;
        let mut buffered = 0usize;
        for item in &parsed.items {
            let body = item.to_json()?;
            let message = self.message(body.clone());
            match self
                .publisher
                .produce(&self.route.exchange, &self.route.routing_key, message)
                .await
            {
                Ok(()) => debug!(link = %item.link, "Published"),
                Err(e) => {
                    warn!(link = %item.link, error = %e, "Publish failed; buffering item");
                    self.fallback.push(&body).await.map_err(IngestError::Store)?;
                    buffered += 1;
                }
            }
            count += 1;
        }

        info!(count, buffered, next_page = %parsed.next_page, "Parse cycle finished");
        Ok(ParseReport {
            count,
            next_page: parsed.next_page,
        })
    }

    /// Re-publish buffered items oldest first until the store is empty.
    ///
    /// Each record is deleted only after its publish succeeded. The first
    /// failure stops the pass and is returned together with how many records
    /// were released before it.
    #[instrument(level = "info", skip_all)]
    pub async fn release(&self) -> Result<usize, ReleaseError> {
        let mut released = 0usize;
        let fail = |released, source| ReleaseError { released, source };

        loop {
            let body = match self.fallback.peek_first().await {
                Ok(body) => body,
                Err(e) if e.is_not_found() => break,
                Err(e) => return Err(fail(released, IngestError::Store(e))),
            };

            let message = self.message(body);
            self.publisher
                .produce(&self.route.exchange, &self.route.routing_key, message)
                .await
                .map_err(|e| fail(released, IngestError::Publish(e)))?;

            self.fallback
                .delete_first()
                .await
                .map_err(|e| fail(released, IngestError::Store(e)))?;
            released += 1;
        }

        if released > 0 {
            info!(released, "Released buffered items");
        }
        Ok(released)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::BrokerError;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Records publishes; fails the calls whose 1-based index is in `fail_on`.
    #[derive(Default)]
    pub struct ScriptedPublisher {
        pub published: Mutex<Vec<Message>>,
        pub fail_on: Mutex<HashSet<usize>>,
        calls: Mutex<usize>,
    }

    impl ScriptedPublisher {
        pub fn failing_on(calls: &[usize]) -> Self {
            Self {
                fail_on: Mutex::new(calls.iter().copied().collect()),
                ..Default::default()
            }
        }

        pub fn bodies(&self) -> Vec<Vec<u8>> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .map(|m| m.body.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Publish for ScriptedPublisher {
        async fn produce(&self, _: &str, _: &str, message: Message) -> Result<(), BrokerError> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            if self.fail_on.lock().unwrap().contains(&call) {
                return Err(BrokerError::NotConnected);
            }
            self.published.lock().unwrap().push(message);
            Ok(())
        }
    }

    /// Always returns the same result.
    pub struct FixedParser(pub Parsed);

    #[async_trait]
    impl Parser for FixedParser {
        async fn parse(&self, _: &CancellationToken, _: &ParseRequest) -> Result<Parsed, ParseError> {
            Ok(self.0.clone())
        }
    }
}
