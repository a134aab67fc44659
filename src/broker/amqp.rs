//! RabbitMQ adapter built on `lapin`.
//!
//! [`AmqpDialer`] opens one AMQP connection with one confirm-mode channel per
//! session. The connection's and the channel's error callbacks both feed the
//! session's fault feed, so a channel closed by the server (e.g. a 406 on a
//! declare) triggers a reconnect just like a dropped socket.

use super::{
    Acknowledge, BrokerChannel, Delivery, DeliveryStream, Dialer, ExchangeKind, Message, Session,
    Topology,
};
use crate::error::BrokerError;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::uri::AMQPUri;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, instrument};

const REPLY_SUCCESS: u16 = 200;
const DELIVERY_MODE_PERSISTENT: u8 = 2;

#[derive(Debug, Clone)]
pub struct AmqpDialer {
    url: String,
}

impl AmqpDialer {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    fn uri(&self) -> Result<AMQPUri, BrokerError> {
        self.url
            .parse::<AMQPUri>()
            .map_err(BrokerError::InvalidAddress)
    }
}

#[async_trait]
impl Dialer for AmqpDialer {
    fn validate(&self) -> Result<(), BrokerError> {
        self.uri().map(|_| ())
    }

    #[instrument(level = "debug", skip_all)]
    async fn dial(&self) -> Result<Session, BrokerError> {
        let uri = self.uri()?;
        let connection = Connection::connect_uri(uri, ConnectionProperties::default()).await?;

        let (slot, rx) = FaultSlot::new();
        let on_conn = slot.clone();
        connection.on_error(move |err| on_conn.report(err.into()));

        let channel = match open_channel(&connection).await {
            Ok(ch) => ch,
            Err(e) => {
                let _ = connection.close(REPLY_SUCCESS, "OK").await;
                return Err(e.into());
            }
        };
        let on_channel = slot;
        channel.on_error(move |err| on_channel.report(err.into()));
        debug!(channel_id = channel.id(), "AMQP channel created with publisher confirms");

        Ok(Session {
            channel: Arc::new(AmqpChannel {
                connection,
                channel,
            }),
            faults: rx,
        })
    }
}

/// A channel in confirm mode, so every publish is acked or nacked.
async fn open_channel(connection: &Connection) -> Result<Channel, lapin::Error> {
    let channel = connection.create_channel().await?;
    channel.confirm_select(ConfirmSelectOptions::default()).await?;
    Ok(channel)
}

/// Sender side of a session's fault feed, shared by the connection and
/// channel error callbacks. Only the first fault is delivered.
#[derive(Clone)]
struct FaultSlot(Arc<Mutex<Option<oneshot::Sender<BrokerError>>>>);

impl FaultSlot {
    fn new() -> (Self, oneshot::Receiver<BrokerError>) {
        let (tx, rx) = oneshot::channel();
        (Self(Arc::new(Mutex::new(Some(tx)))), rx)
    }

    fn report(&self, fault: BrokerError) {
        let sender = match self.0.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(tx) = sender {
            let _ = tx.send(fault);
        }
    }
}

/// Map a publisher confirm to the publish outcome.
fn confirmed(confirm: Confirmation, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
    match confirm {
        Confirmation::Nack(_) => Err(BrokerError::Rejected(format!(
            "nack for exchange {exchange:?} routing key {routing_key:?}"
        ))),
        Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
    }
}

pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
    }
}

fn properties(message: &Message) -> BasicProperties {
    let mut props = BasicProperties::default().with_content_type(message.content_type.clone().into());
    if message.persistent {
        props = props.with_delivery_mode(DELIVERY_MODE_PERSISTENT);
    }
    if let Some(app_id) = &message.app_id {
        props = props.with_app_id(app_id.clone().into());
    }
    if let Some(message_id) = &message.message_id {
        props = props.with_message_id(message_id.clone().into());
    }
    props
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare(&self, topology: &Topology) -> Result<(), BrokerError> {
        for exchange in &topology.exchanges {
            self.channel
                .exchange_declare(
                    &exchange.name,
                    exchange_kind(exchange.kind),
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
        }
        for queue in &topology.queues {
            self.channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
        }
        for binding in &topology.bindings {
            self.channel
                .queue_bind(
                    &binding.queue,
                    &binding.exchange,
                    &binding.routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<(), BrokerError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties(message),
            )
            .await?
            .await?;

        confirmed(confirm, exchange, routing_key)
    }

    async fn consume(&self, queue: &str, auto_ack: bool) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_ack: auto_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let stream = consumer.map(move |res| {
            res.map_err(BrokerError::from).map(|delivery| {
                let acker = if auto_ack {
                    None
                } else {
                    Some(Box::new(AmqpAck(delivery.acker)) as Box<dyn Acknowledge>)
                };
                Delivery::new(delivery.data, acker)
            })
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut first_err = None;
        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(REPLY_SUCCESS, "OK").await {
                first_err = Some(BrokerError::from(e));
            }
        }
        if self.connection.status().connected() {
            if let Err(e) = self.connection.close(REPLY_SUCCESS, "OK").await {
                first_err.get_or_insert(BrokerError::from(e));
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

struct AmqpAck(lapin::acker::Acker);

#[async_trait]
impl Acknowledge for AmqpAck {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }
}
