//! Message broker plumbing.
//!
//! The broker layer is split the same way the rest of the pipeline is:
//!
//! - [`connection`]: one resilient connection + channel, reopened
//!   transparently after a fault
//! - [`producer`]: publish one message with a bounded timeout
//! - [`consumer`]: pull deliveries from a queue and hand them to a handler
//! - [`amqp`]: the RabbitMQ implementation of [`Dialer`] and
//!   [`BrokerChannel`] on top of `lapin`
//!
//! Everything above [`amqp`] talks to the broker only through the traits in
//! this module, which keeps the reconnect logic testable without a server.

pub mod amqp;
pub mod connection;
pub mod consumer;
pub mod producer;

use crate::error::BrokerError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

/// One outgoing broker message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub content_type: String,
    /// Persistent messages survive a broker restart (AMQP delivery mode 2).
    pub persistent: bool,
    pub app_id: Option<String>,
    pub message_id: Option<String>,
    pub body: Vec<u8>,
}

impl Message {
    /// A persistent `application/json` message.
    pub fn json(body: Vec<u8>) -> Self {
        Self {
            content_type: CONTENT_TYPE_JSON.to_string(),
            persistent: true,
            app_id: None,
            message_id: None,
            body,
        }
    }

    /// A persistent `text/plain` message.
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            content_type: CONTENT_TYPE_TEXT.to_string(),
            persistent: true,
            app_id: None,
            message_id: None,
            body: body.into().into_bytes(),
        }
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }
}

/// How the query exchange routes to worker queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExchangeKind {
    /// Every worker receives every query.
    Fanout,
    /// A query reaches only the worker whose id is its routing key.
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// Exchanges, queues and bindings declared on every (re)connect.
///
/// All of them are declared durable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub exchanges: Vec<Exchange>,
    pub queues: Vec<String>,
    pub bindings: Vec<Binding>,
}

impl Topology {
    /// The topology of one ingestion worker:
    ///
    /// - a `query_exchange` of the given kind with the worker's own
    ///   `query.<id>` queue bound to it (under the worker id when direct)
    /// - the shared `news_queue`, fed through the default exchange
    pub fn for_worker(
        worker_id: &str,
        query_exchange: &str,
        query_kind: ExchangeKind,
        news_queue: &str,
    ) -> Self {
        let query_queue = search_queue_name(query_exchange, worker_id);
        let routing_key = match query_kind {
            ExchangeKind::Fanout => String::new(),
            ExchangeKind::Direct => worker_id.to_string(),
        };
        Self {
            exchanges: vec![Exchange {
                name: query_exchange.to_string(),
                kind: query_kind,
            }],
            queues: vec![query_queue.clone(), news_queue.to_string()],
            bindings: vec![Binding {
                queue: query_queue,
                exchange: query_exchange.to_string(),
                routing_key,
            }],
        }
    }
}

/// Name of the per-worker search queue bound to the query exchange.
pub fn search_queue_name(query_exchange: &str, worker_id: &str) -> String {
    format!("{query_exchange}.{worker_id}")
}

/// Acknowledges one delivery back to the broker.
#[async_trait]
pub trait Acknowledge: Send {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;
}

/// One incoming message.
///
/// `acker` is `None` for auto-ack subscriptions.
pub struct Delivery {
    pub body: Vec<u8>,
    acker: Option<Box<dyn Acknowledge>>,
}

impl Delivery {
    pub fn new(body: Vec<u8>, acker: Option<Box<dyn Acknowledge>>) -> Self {
        Self { body, acker }
    }

    /// Acknowledge the delivery. A no-op for auto-ack deliveries.
    pub async fn ack(self) -> Result<(), BrokerError> {
        match self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("bytes", &self.body.len())
            .field("manual_ack", &self.acker.is_some())
            .finish()
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// An open broker channel.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare(&self, topology: &Topology) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<(), BrokerError>;

    async fn consume(&self, queue: &str, auto_ack: bool) -> Result<DeliveryStream, BrokerError>;

    /// Close the channel and its underlying connection.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// A freshly dialed channel plus its fault feed.
///
/// The fault feed fires once when the session dies on its own. It is never
/// fed by an orderly [`BrokerChannel::close`].
pub struct Session {
    pub channel: Arc<dyn BrokerChannel>,
    pub faults: oneshot::Receiver<BrokerError>,
}

/// Knows how to reach one broker.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Check the address without touching the network.
    fn validate(&self) -> Result<(), BrokerError>;

    async fn dial(&self) -> Result<Session, BrokerError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-process broker doubles.

    use super::*;
    use futures::StreamExt;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Published {
        pub exchange: String,
        pub routing_key: String,
        pub message: Message,
    }

    /// State shared by every channel a [`FakeDialer`] hands out.
    #[derive(Default)]
    pub struct FakeBroker {
        pub published: Mutex<Vec<Published>>,
        pub declared: Mutex<Vec<Topology>>,
        pub acked: AtomicUsize,
        pub closes: AtomicUsize,
        faults: Mutex<Vec<oneshot::Sender<BrokerError>>>,
        deliveries: Mutex<Option<mpsc::UnboundedReceiver<Result<Delivery, BrokerError>>>>,
    }

    impl FakeBroker {
        /// Kill the most recent session as if the server dropped it.
        pub fn kill_session(&self) {
            if let Some(tx) = self.faults.lock().unwrap().pop() {
                let _ = tx.send(BrokerError::Transport("connection reset".into()));
            }
        }

        /// Feed the next `consume` call from the returned sender.
        pub fn delivery_feed(&self) -> mpsc::UnboundedSender<Result<Delivery, BrokerError>> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.deliveries.lock().unwrap() = Some(rx);
            tx
        }

        pub fn published(&self) -> Vec<Published> {
            self.published.lock().unwrap().clone()
        }
    }

    pub struct FakeChannel {
        broker: Arc<FakeBroker>,
        open: AtomicBool,
        reject_publish: bool,
    }

    #[async_trait]
    impl BrokerChannel for FakeChannel {
        async fn declare(&self, topology: &Topology) -> Result<(), BrokerError> {
            self.broker.declared.lock().unwrap().push(topology.clone());
            Ok(())
        }

        async fn publish(
            &self,
            exchange: &str,
            routing_key: &str,
            message: &Message,
        ) -> Result<(), BrokerError> {
            if !self.open.load(Ordering::SeqCst) {
                return Err(BrokerError::Transport("channel closed".into()));
            }
            if self.reject_publish {
                return Err(BrokerError::Rejected("nack".into()));
            }
            self.broker.published.lock().unwrap().push(Published {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                message: message.clone(),
            });
            Ok(())
        }

        async fn consume(&self, _queue: &str, auto_ack: bool) -> Result<DeliveryStream, BrokerError> {
            let rx = self
                .broker
                .deliveries
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| BrokerError::Transport("no delivery feed".into()))?;
            let broker = Arc::clone(&self.broker);
            let stream = tokio_stream_from(rx).map(move |res| {
                res.map(|d| {
                    if auto_ack {
                        Delivery::new(d.body, None)
                    } else {
                        Delivery::new(
                            d.body,
                            Some(Box::new(CountingAck(Arc::clone(&broker))) as Box<dyn Acknowledge>),
                        )
                    }
                })
            });
            Ok(stream.boxed())
        }

        async fn close(&self) -> Result<(), BrokerError> {
            self.open.store(false, Ordering::SeqCst);
            self.broker.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn tokio_stream_from<T: Send + 'static>(
        mut rx: mpsc::UnboundedReceiver<T>,
    ) -> BoxStream<'static, T> {
        futures::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed()
    }

    struct CountingAck(Arc<FakeBroker>);

    #[async_trait]
    impl Acknowledge for CountingAck {
        async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
            self.0.acked.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Dials [`FakeChannel`]s. The first `fail_first` dials fail, and so
    /// does every dial while `refuse` is set.
    pub struct FakeDialer {
        pub broker: Arc<FakeBroker>,
        pub dials: AtomicUsize,
        pub fail_first: usize,
        pub refuse: AtomicBool,
        pub reject_publish: bool,
    }

    impl FakeDialer {
        pub fn new(broker: Arc<FakeBroker>) -> Self {
            Self {
                broker,
                dials: AtomicUsize::new(0),
                fail_first: 0,
                refuse: AtomicBool::new(false),
                reject_publish: false,
            }
        }
    }

    #[async_trait]
    impl Dialer for FakeDialer {
        fn validate(&self) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn dial(&self) -> Result<Session, BrokerError> {
            let n = self.dials.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first || self.refuse.load(Ordering::SeqCst) {
                return Err(BrokerError::Transport("connection refused".into()));
            }
            let (tx, rx) = oneshot::channel();
            self.broker.faults.lock().unwrap().push(tx);
            Ok(Session {
                channel: Arc::new(FakeChannel {
                    broker: Arc::clone(&self.broker),
                    open: AtomicBool::new(true),
                    reject_publish: self.reject_publish,
                }),
                faults: rx,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_topology() {
        let t = Topology::for_worker("lenta", "query", ExchangeKind::Fanout, "news");
        assert_eq!(t.exchanges[0].kind, ExchangeKind::Fanout);
        assert_eq!(t.queues, vec!["query.lenta".to_string(), "news".to_string()]);
        assert_eq!(t.bindings[0].queue, "query.lenta");
        assert_eq!(t.bindings[0].exchange, "query");
        assert_eq!(t.bindings[0].routing_key, "");
    }

    #[test]
    fn test_direct_query_exchange_binds_worker_id() {
        let t = Topology::for_worker("ria", "query", ExchangeKind::Direct, "news");
        assert_eq!(t.exchanges[0].kind, ExchangeKind::Direct);
        assert_eq!(t.bindings[0].queue, "query.ria");
        assert_eq!(t.bindings[0].routing_key, "ria");
    }

    #[test]
    fn test_message_builders() {
        let m = Message::json(b"{}".to_vec())
            .with_app_id("ria")
            .with_message_id("abc");
        assert_eq!(m.content_type, "application/json");
        assert!(m.persistent);
        assert_eq!(m.app_id.as_deref(), Some("ria"));
        assert_eq!(m.message_id.as_deref(), Some("abc"));

        assert_eq!(Message::text("ru news").body, b"ru news".to_vec());
    }

    #[tokio::test]
    async fn test_auto_ack_delivery_ack_is_noop() {
        let d = Delivery::new(b"x".to_vec(), None);
        assert!(d.ack().await.is_ok());
    }
}
