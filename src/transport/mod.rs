//! The seam between `burrow` and the AMQP client doing the actual talking.
//!
//! Every interaction the orchestration layer has with RabbitMq goes through the traits in this
//! module: [`Transport`] to establish a [`Connection`], [`Connection`] to open [`Channel`]s,
//! [`Channel`] to declare topology, publish and subscribe, and [`Acker`] to settle a
//! [`Delivery`].
//!
//! The production implementation is backed by [`lapin`] - see
//! [`ConnectionFactory`](crate::amqp::ConnectionFactory).
//! You can plug in your own implementation via [`Broker::with_transport`](crate::Broker::with_transport).
use crate::topology::{ExchangeDeclaration, ExchangeKind, QueueDeclaration};
use amq_protocol_types::{DeliveryTag, FieldTable, ShortString};
use futures_util::stream::BoxStream;
use lapin::BasicProperties;
use std::sync::Arc;

mod lapin_impl;

pub(crate) use lapin_impl::lapin_connection;

/// A stream of messages pushed by the broker on a consumer subscription.
///
/// The stream ends when the subscription is cancelled or the channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, TransportError>>;

/// Establishes connections to a RabbitMq broker.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a new connection.
    ///
    /// Errors classified as [`TransportError::Io`] are considered transient: the caller may
    /// retry after a delay.
    async fn connect(&self) -> Result<Arc<dyn Connection>, TransportError>;
}

/// A live connection to a RabbitMq broker, multiplexing many channels.
#[async_trait::async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Open a new channel on this connection.
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError>;

    /// `true` if the connection is still usable.
    fn is_connected(&self) -> bool;

    /// Close the connection, and all channels with it.
    async fn close(&self) -> Result<(), TransportError>;
}

/// A channel: the unit of concurrency isolation on top of a [`Connection`].
#[async_trait::async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Set the maximum number of unacknowledged messages the broker will push to consumers
    /// on this channel.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError>;

    /// Enable publisher confirms on this channel.
    async fn confirm_select(&self) -> Result<(), TransportError>;

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: &ExchangeKind,
        declaration: &ExchangeDeclaration,
    ) -> Result<(), TransportError>;

    /// Declare a queue and return its name.
    ///
    /// The returned name differs from `queue` when `queue` is empty and the broker generates one.
    async fn queue_declare(
        &self,
        queue: &str,
        declaration: &QueueDeclaration,
    ) -> Result<String, TransportError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    /// Publish a message and wait for the broker confirmation, if confirms are enabled.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<Confirmation, TransportError>;

    /// Start a subscription on `queue`.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
        arguments: FieldTable,
    ) -> Result<DeliveryStream, TransportError>;

    /// Cancel the subscription identified by `consumer_tag`. No new deliveries arrive afterwards.
    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    /// `true` if the channel (and its connection) are still usable.
    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Settles a single delivery with the broker.
#[async_trait::async_trait]
pub trait Acker: Send + Sync + 'static {
    async fn ack(&self) -> Result<(), TransportError>;

    async fn nack(&self, requeue: bool) -> Result<(), TransportError>;

    async fn reject(&self, requeue: bool) -> Result<(), TransportError>;
}

/// A message pushed by the broker on a subscription.
pub struct Delivery {
    /// The delivery tag of the message, scoped to the channel it was delivered on.
    pub delivery_tag: DeliveryTag,
    /// The exchange the message was published to. Empty for the default exchange.
    pub exchange: ShortString,
    /// The routing key the message was published with.
    pub routing_key: ShortString,
    /// Whether this message was delivered before.
    pub redelivered: bool,
    /// The properties and headers of the message.
    pub properties: BasicProperties,
    /// The payload of the message.
    pub data: Vec<u8>,
    /// Used to ack/nack/reject the message.
    pub acker: Box<dyn Acker>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Flags attached to a publish.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublishOptions {
    /// If `true`, the broker returns messages that cannot be routed to any queue.
    /// If `false`, the broker silently drops them.
    pub mandatory: bool,
    /// The immediate flag was dropped in RabbitMQ 3.0 - see <https://www.rabbitmq.com/blog/2012/11/19/breaking-things-with-rabbitmq-3-0/>.
    /// Setting `true` against a modern RabbitMq will cause a not-supported error.
    pub immediate: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            mandatory: true,
            immediate: false,
        }
    }
}

/// What the broker told us about a published message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Confirmation {
    /// The broker took responsibility for the message.
    Ack,
    /// The broker confirmed the message but could not route it (mandatory publish).
    Returned { reply_code: u16, reply_text: String },
    /// The broker refused the message.
    Nack,
    /// Publisher confirms are not enabled on the channel.
    NotRequested,
}

/// Failures surfaced by a [`Transport`] implementation.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// The channel or the connection is no longer open.
    #[error("The channel or connection is closed")]
    Closed,
    /// A network-level failure. Usually transient.
    #[error("I/O failure while talking to the broker")]
    Io(#[source] anyhow::Error),
    /// The broker refused the operation - e.g. authentication failure, declaration mismatch.
    #[error("The broker refused the operation: {0}")]
    Refused(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TransportError {
    /// `true` if retrying the same operation later might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
