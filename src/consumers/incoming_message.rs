use crate::transport::{Acker, Delivery, TransportError};
use crate::Error;
use amq_protocol_types::{DeliveryTag, FieldTable};
use lapin::BasicProperties;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A message pushed by RabbitMq on a consumer subscription, handed over to a
/// [`Handler`](crate::consumers::Handler) for processing.
///
/// `IncomingMessage` is cheap to clone: all clones refer to the same delivery and share its
/// settlement state.
///
/// # Settlement
///
/// A message can be settled with the broker at most once, using [`ack`](Self::ack),
/// [`nack`](Self::nack) or [`reject`](Self::reject). Further attempts are no-ops.
/// If the handler returns without settling the message, the framework settles it according
/// to the outcome of processing - see [`HandlerError`](crate::consumers::HandlerError).
///
/// Messages consumed with `auto_ack` are settled by the broker on delivery: all settlement
/// methods are no-ops.
#[derive(Clone)]
pub struct IncomingMessage {
    inner: Arc<Inner>,
}

struct Inner {
    queue_name: String,
    delivery_tag: DeliveryTag,
    exchange: String,
    routing_key: String,
    redelivered: bool,
    properties: BasicProperties,
    data: Vec<u8>,
    // AMQP forbids settling the same delivery tag twice:
    // https://www.rabbitmq.com/amqp-0-9-1-reference.html#basic.ack.delivery-tag
    acker: Box<dyn Acker>,
    settled: AtomicBool,
}

impl IncomingMessage {
    pub(crate) fn new(delivery: Delivery, queue_name: &str, auto_ack: bool) -> Self {
        let Delivery {
            delivery_tag,
            exchange,
            routing_key,
            redelivered,
            properties,
            data,
            acker,
        } = delivery;
        Self {
            inner: Arc::new(Inner {
                queue_name: queue_name.to_owned(),
                delivery_tag,
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                redelivered,
                properties,
                data,
                acker,
                settled: AtomicBool::new(auto_ack),
            }),
        }
    }

    /// The payload of the message.
    pub fn body(&self) -> &[u8] {
        &self.inner.data
    }

    /// The routing key the message was published with.
    pub fn routing_key(&self) -> &str {
        &self.inner.routing_key
    }

    /// The exchange the message was published to. Empty for the default exchange.
    pub fn exchange(&self) -> &str {
        &self.inner.exchange
    }

    /// The name of the queue the message was consumed from.
    pub fn queue_name(&self) -> &str {
        &self.inner.queue_name
    }

    pub fn delivery_tag(&self) -> DeliveryTag {
        self.inner.delivery_tag
    }

    /// `true` if the broker delivered this message before, to this or another consumer.
    pub fn redelivered(&self) -> bool {
        self.inner.redelivered
    }

    /// The AMQP headers attached to the message, if any.
    ///
    /// See [`BasicPropertiesExt`](crate::amqp::convenience::BasicPropertiesExt) for typed lookups.
    pub fn headers(&self) -> Option<&FieldTable> {
        self.inner.properties.headers().as_ref()
    }

    /// All the AMQP properties of the message - content type, message id, timestamp, etc.
    pub fn properties(&self) -> &BasicProperties {
        &self.inner.properties
    }

    /// `true` once the message has been settled with the broker (or if it was auto-acked).
    pub fn is_settled(&self) -> bool {
        self.inner.settled.load(Ordering::SeqCst)
    }

    /// Positive acknowledgement - the message is removed from the queue.
    pub async fn ack(&self) -> Result<(), Error> {
        if !self.try_settle("ack") {
            return Ok(());
        }
        self.settled_with(self.inner.acker.ack().await)
    }

    /// Negative acknowledgement.
    ///
    /// With `requeue` set to `false` the message is routed to the dead letter exchange of the
    /// queue, if one is configured, or discarded.
    pub async fn nack(&self, requeue: bool) -> Result<(), Error> {
        if !self.try_settle("nack") {
            return Ok(());
        }
        self.settled_with(self.inner.acker.nack(requeue).await)
    }

    /// Reject the message. Same broker semantics as [`nack`](Self::nack) for a single message.
    pub async fn reject(&self, requeue: bool) -> Result<(), Error> {
        if !self.try_settle("reject") {
            return Ok(());
        }
        self.settled_with(self.inner.acker.reject(requeue).await)
    }

    /// Claim the right to settle the message. Returns `false` if it was already settled.
    fn try_settle(&self, action: &str) -> bool {
        let already_settled = self.inner.settled.swap(true, Ordering::SeqCst);
        if already_settled {
            tracing::debug!(
                queue_name = %self.inner.queue_name,
                delivery_tag = self.inner.delivery_tag,
                "Ignoring {action}: the message has already been settled"
            );
        }
        !already_settled
    }

    fn settled_with(&self, outcome: Result<(), TransportError>) -> Result<(), Error> {
        match outcome {
            Ok(()) => Ok(()),
            // The broker requeues all unsettled messages when a channel goes away.
            Err(TransportError::Closed) => {
                tracing::warn!(
                    queue_name = %self.inner.queue_name,
                    delivery_tag = self.inner.delivery_tag,
                    "The channel was closed before the message could be settled"
                );
                Ok(())
            }
            Err(e) => Err(Error::Transport(e)),
        }
    }
}

impl std::fmt::Debug for IncomingMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingMessage")
            .field("queue_name", &self.inner.queue_name)
            .field("delivery_tag", &self.inner.delivery_tag)
            .field("exchange", &self.inner.exchange)
            .field("routing_key", &self.inner.routing_key)
            .field("redelivered", &self.inner.redelivered)
            .field("settled", &self.is_settled())
            .finish()
    }
}
