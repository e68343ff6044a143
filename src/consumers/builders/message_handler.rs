use crate::consumers::{
    handler::ClosureHandler, hooks::transient_error::NeverRequeue, ConsumerTransientErrorHook,
    Handler, HandlerError, IncomingMessage,
};
use crate::topology::{ExchangeDeclaration, ExchangeKind, QueueDeclaration};
use crate::Error;
use amq_protocol_types::{AMQPValue, FieldTable};
use std::future::Future;
use std::sync::Arc;

/// The consume argument used to set the priority of a consumer.
/// See <https://www.rabbitmq.com/consumer-priority.html#how-to-use>.
const PRIORITY_ARGUMENT: &str = "x-priority";

/// The queue argument pointing RabbitMq to the dead letter exchange of a queue.
const DEAD_LETTER_EXCHANGE_ARGUMENT: &str = "x-dead-letter-exchange";

/// Immutable configuration of a consumer: where messages come from and how they are pulled.
///
/// Use [`ConsumerSpec::builder`] to start composing one.
#[derive(Clone, Debug)]
pub struct ConsumerSpec {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) exchange_kind: ExchangeKind,
    pub(crate) routing_key: String,
    pub(crate) queue_declaration: QueueDeclaration,
    pub(crate) exchange_declaration: ExchangeDeclaration,
    pub(crate) prefetch_count: Option<u16>,
    pub(crate) auto_ack: bool,
    pub(crate) arguments: FieldTable,
    pub(crate) dead_letter_queue: bool,
}

impl ConsumerSpec {
    /// Start building a consumer for `queue_name`, bound to `exchange_name`.
    ///
    /// Unless customised, the exchange is a transient `direct` exchange and the queue is bound
    /// using the exchange name as routing key.
    pub fn builder(
        queue_name: impl Into<String>,
        exchange_name: impl Into<String>,
    ) -> ConsumerSpecBuilder {
        let exchange_name = exchange_name.into();
        ConsumerSpecBuilder {
            spec: ConsumerSpec {
                queue_name: queue_name.into(),
                routing_key: exchange_name.clone(),
                exchange_name,
                exchange_kind: ExchangeKind::default(),
                queue_declaration: QueueDeclaration::default(),
                exchange_declaration: ExchangeDeclaration::default(),
                prefetch_count: None,
                auto_ack: false,
                arguments: FieldTable::default(),
                dead_letter_queue: false,
            },
            transient_error_hook: None,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn exchange_kind(&self) -> &ExchangeKind {
        &self.exchange_kind
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn prefetch_count(&self) -> Option<u16> {
        self.prefetch_count
    }

    pub fn auto_ack(&self) -> bool {
        self.auto_ack
    }

    /// The name of the dead letter exchange and queue, if dead-lettering was requested.
    pub fn dead_letter_name(&self) -> Option<String> {
        self.dead_letter_queue
            .then(|| format!("{}.deadletter", self.queue_name))
    }

    /// The queue declaration, including the arguments required by the dead letter topology.
    pub(crate) fn effective_queue_declaration(&self) -> QueueDeclaration {
        match self.dead_letter_name() {
            Some(dead_letter) => self.queue_declaration.clone().with_argument(
                DEAD_LETTER_EXCHANGE_ARGUMENT,
                AMQPValue::LongString(dead_letter.into()),
            ),
            None => self.queue_declaration.clone(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        self.exchange_declaration
            .validate(&self.exchange_name, &self.exchange_kind)?;
        self.queue_declaration.validate(&self.queue_name)?;
        if self.prefetch_count == Some(0) {
            return Err(Error::Configuration(format!(
                "the prefetch count of the consumer on `{}` must be positive - leave it unset for no limit",
                self.queue_name
            )));
        }
        if self.dead_letter_queue {
            if self.queue_name.is_empty() {
                return Err(Error::Configuration(
                    "a dead letter queue requires a named queue".into(),
                ));
            }
            if self.queue_declaration.passive {
                return Err(Error::Configuration(format!(
                    "queue `{}` is declared passive: its dead letter exchange cannot be configured",
                    self.queue_name
                )));
            }
        }
        Ok(())
    }
}

/// A handler processing messages from a RabbitMq queue, ready to be registered with a
/// [`Broker`](crate::Broker).
///
/// Use [`ConsumerSpec::builder`] to start composing a `MessageHandler` using a fluent builder
/// API.
pub struct MessageHandler {
    pub(crate) spec: ConsumerSpec,
    pub(crate) transient_error_hook: Arc<dyn ConsumerTransientErrorHook>,
    pub(crate) handler: Arc<dyn Handler>,
}

impl MessageHandler {
    pub fn spec(&self) -> &ConsumerSpec {
        &self.spec
    }
}

/// A builder to compose a [`MessageHandler`] with a fluent API.
///
/// Use [`ConsumerSpec::builder`] as entrypoint.
pub struct ConsumerSpecBuilder {
    spec: ConsumerSpec,
    transient_error_hook: Option<Arc<dyn ConsumerTransientErrorHook>>,
}

impl ConsumerSpecBuilder {
    /// The routing semantics of the exchange. Defaults to [`ExchangeKind::Direct`].
    #[must_use]
    pub fn exchange_kind(mut self, kind: ExchangeKind) -> Self {
        self.spec.exchange_kind = kind;
        self
    }

    /// The routing key (or pattern, for topic exchanges) used to bind the queue to the exchange.
    /// Defaults to the exchange name.
    #[must_use]
    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.spec.routing_key = routing_key.into();
        self
    }

    #[must_use]
    pub fn queue_declaration(mut self, declaration: QueueDeclaration) -> Self {
        self.spec.queue_declaration = declaration;
        self
    }

    #[must_use]
    pub fn exchange_declaration(mut self, declaration: ExchangeDeclaration) -> Self {
        self.spec.exchange_declaration = declaration;
        self
    }

    /// The maximum number of messages processed concurrently by this consumer.
    ///
    /// It is used both as broker-side QoS (the broker will not push more unacknowledged messages)
    /// and as a local bound on in-flight handler invocations.
    /// There is no limit if left unspecified.
    #[must_use]
    pub fn prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.spec.prefetch_count = Some(prefetch_count);
        self
    }

    /// Messages are acknowledged by the broker as soon as they are delivered.
    ///
    /// Processing failures can then only be logged: the message is gone.
    #[must_use]
    pub fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.spec.auto_ack = auto_ack;
        self
    }

    /// Add a broker-specific argument to the consume request.
    #[must_use]
    pub fn with_argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.spec.arguments.insert(key.into(), value);
        self
    }

    /// Consumer priorities allow you to ensure that high priority consumers receive messages
    /// while they are active, with messages only going to lower priority consumers when the
    /// high priority consumers block.
    ///
    /// Sets the `x-priority` consume argument.
    /// See <https://www.rabbitmq.com/consumer-priority.html#how-to-use>.
    ///
    /// Default not specified, equivalent to `0`.
    #[must_use]
    pub fn with_priority(self, priority: i32) -> Self {
        self.with_argument(PRIORITY_ARGUMENT, AMQPValue::LongInt(priority))
    }

    /// Declare a [dead letter exchange](https://www.rabbitmq.com/dlx.html) for the queue.
    ///
    /// Specifically, the queue `<queue_name>.deadletter` is declared and bound to the fanout
    /// exchange `<queue_name>.deadletter`, which is set as the dead letter exchange of the queue.
    ///
    /// Given that AMQP queue's settings are immutable, enabling dead-lettering on an existing
    /// queue requires rolling a new queue.
    #[must_use]
    pub fn with_dead_letter_queue(mut self) -> Self {
        self.spec.dead_letter_queue = true;
        self
    }

    /// A transient error hook allows you to customise the behaviour of the consumer
    /// when the processing of an incoming message fails with an error classified as transient -
    /// e.g. retryable.
    ///
    /// Check out [`ConsumerTransientErrorHook`]'s documentation for more details.
    ///
    /// [`NeverRequeue`] is used if unspecified.
    #[must_use]
    pub fn transient_error_hook<H: ConsumerTransientErrorHook>(self, hook: H) -> Self {
        self.dyn_transient_error_hook(Arc::new(hook))
    }

    /// A version of [`ConsumerSpecBuilder::transient_error_hook`] for already Arc-ed hooks.
    ///
    /// Useful for sharing `!Clone` hooks.
    #[must_use]
    pub fn dyn_transient_error_hook(mut self, hook: Arc<dyn ConsumerTransientErrorHook>) -> Self {
        self.transient_error_hook = Some(hook);
        self
    }

    /// The handler function used to process incoming messages.
    ///
    /// Passing in the handler function finalises the `MessageHandler` construction.
    pub fn handler<F, Fut, Err>(self, handler: F) -> MessageHandler
    where
        F: Fn(IncomingMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Err>> + Send + 'static,
        Err: Into<HandlerError> + 'static,
    {
        self.raw_handler(ClosureHandler(handler))
    }

    /// The raw handler used to process incoming messages. Prefer `handler` if you
    /// only want to register a function handler.
    ///
    /// Check out [`Handler`]'s documentation for more details.
    pub fn raw_handler<H: Handler>(self, handler: H) -> MessageHandler {
        self.raw_arc_handler(Arc::new(handler))
    }

    /// The raw Arc<handler> used to process incoming messages.
    ///
    /// Useful to share the same handler across consumers.
    pub fn raw_arc_handler(self, handler: Arc<dyn Handler>) -> MessageHandler {
        let Self {
            spec,
            transient_error_hook,
        } = self;
        MessageHandler {
            spec,
            transient_error_hook: transient_error_hook.unwrap_or_else(|| Arc::new(NeverRequeue)),
            handler,
        }
    }
}
