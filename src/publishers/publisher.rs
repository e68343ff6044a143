use crate::publishers::outgoing_message::{OutgoingMessage, PERSISTENT};
use crate::topology::{ExchangeDeclaration, ExchangeKind};
use crate::transport::{Channel, Confirmation, Connection, PublishOptions};
use crate::Error;
use lapin::BasicProperties;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;
use uuid::Uuid;

const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(3);

/// Immutable configuration of a publisher: the exchange it owns and how it publishes to it.
///
/// Use [`PublisherSpec::builder`] to start composing one.
#[derive(Clone, Debug)]
pub struct PublisherSpec {
    pub(crate) exchange_name: String,
    pub(crate) exchange_kind: ExchangeKind,
    pub(crate) exchange_declaration: ExchangeDeclaration,
    pub(crate) default_routing_key: Option<String>,
    pub(crate) publish_timeout: Duration,
}

impl PublisherSpec {
    /// Start building a publisher for `exchange_name`.
    ///
    /// Unless customised, the exchange is a transient `direct` exchange and there is no default
    /// routing key.
    pub fn builder(exchange_name: impl Into<String>) -> PublisherSpecBuilder {
        PublisherSpecBuilder {
            spec: PublisherSpec {
                exchange_name: exchange_name.into(),
                exchange_kind: ExchangeKind::default(),
                exchange_declaration: ExchangeDeclaration::default(),
                default_routing_key: None,
                publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            },
        }
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn exchange_kind(&self) -> &ExchangeKind {
        &self.exchange_kind
    }

    pub fn default_routing_key(&self) -> Option<&str> {
        self.default_routing_key.as_deref()
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        self.exchange_declaration
            .validate(&self.exchange_name, &self.exchange_kind)
    }
}

/// A builder for [`PublisherSpec`].
///
/// Use [`PublisherSpec::builder`] as entrypoint.
pub struct PublisherSpecBuilder {
    spec: PublisherSpec,
}

impl PublisherSpecBuilder {
    #[must_use]
    pub fn exchange_kind(mut self, kind: ExchangeKind) -> Self {
        self.spec.exchange_kind = kind;
        self
    }

    #[must_use]
    pub fn exchange_declaration(mut self, declaration: ExchangeDeclaration) -> Self {
        self.spec.exchange_declaration = declaration;
        self
    }

    /// The routing key used when [`Publisher::publish`] is not given one.
    #[must_use]
    pub fn default_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.spec.default_routing_key = Some(routing_key.into());
        self
    }

    /// Timeout applied when attempting to publish a message.
    /// Defaults to 3 seconds if left unspecified.
    #[must_use]
    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.spec.publish_timeout = timeout;
        self
    }

    /// Finalise the builder and get an instance of [`PublisherSpec`].
    pub fn build(self) -> PublisherSpec {
        self.spec
    }
}

/// A high-level interface to publish messages to a single exchange.
///
/// You get a shared handle back from [`Broker::register_publisher`](crate::Broker::register_publisher).
/// The publisher becomes usable once the broker has been started.
///
/// # Fault tolerance
///
/// Publishing never hangs: the whole operation is bounded by the publish timeout and it fails
/// straight away if the connection is gone.
/// Publisher confirms are always enabled - `publish` returns once the broker has taken
/// responsibility for the message.
pub struct Publisher {
    spec: PublisherSpec,
    channel: RwLock<Option<Arc<dyn Channel>>>,
    /// Serializes `start`.
    starting: tokio::sync::Mutex<()>,
}

impl Publisher {
    pub(crate) fn new(spec: PublisherSpec) -> Self {
        Self {
            spec,
            channel: RwLock::new(None),
            starting: tokio::sync::Mutex::new(()),
        }
    }

    pub fn spec(&self) -> &PublisherSpec {
        &self.spec
    }

    /// `true` if the publisher has an open channel.
    pub fn is_active(&self) -> bool {
        self.current_channel()
            .map(|channel| channel.is_open())
            .unwrap_or(false)
    }

    /// Open a channel on `connection`, enable publisher confirms and declare the exchange.
    ///
    /// Starting a publisher whose channel is open is a no-op.
    /// If the previous channel died, a new one replaces it.
    #[tracing::instrument(skip_all, name = "publisher_start", fields(exchange = %self.spec.exchange_name))]
    pub async fn start(&self, connection: &dyn Connection) -> Result<(), Error> {
        let _guard = self.starting.lock().await;
        if self.is_active() {
            tracing::debug!("The publisher is already started");
            return Ok(());
        }

        let channel = connection.create_channel().await?;
        if let Err(e) = self.prepare(channel.as_ref()).await {
            if let Err(close_error) = channel.close().await {
                tracing::debug!(error = ?close_error, "Failed to close the publisher channel");
            }
            return Err(e);
        }

        let previous = self.set_channel(Some(channel));
        if let Some(previous) = previous {
            // Already dead, but make sure the transport releases it.
            if let Err(e) = previous.close().await {
                tracing::debug!(error = ?e, "Failed to close the previous publisher channel");
            }
        }
        tracing::info!("Publisher started");
        Ok(())
    }

    async fn prepare(&self, channel: &dyn Channel) -> Result<(), Error> {
        channel.confirm_select().await?;
        channel
            .exchange_declare(
                &self.spec.exchange_name,
                &self.spec.exchange_kind,
                &self.spec.exchange_declaration,
            )
            .await
            .map_err(|e| Error::declaration("exchange", &self.spec.exchange_name, e))
    }

    /// Publish a message to the exchange of this publisher.
    ///
    /// `routing_key` takes precedence over the default routing key of the publisher.
    ///
    /// The message is published as `mandatory`: if it cannot be routed to any queue,
    /// [`Error::Unroutable`] is returned.
    /// Use [`Publisher::publish_with_options`] to overwrite this behaviour.
    pub async fn publish(
        &self,
        message: OutgoingMessage,
        routing_key: Option<&str>,
    ) -> Result<(), Error> {
        self.publish_with_options(message, routing_key, PublishOptions::default())
            .await
    }

    /// Publish a message to the exchange of this publisher.
    ///
    /// A message id and a timestamp are added to the message if missing. Messages are
    /// persistent unless a delivery mode was set explicitly.
    #[tracing::instrument(
        skip_all,
        name = "publish",
        fields(exchange = %self.spec.exchange_name),
        level = tracing::Level::DEBUG
    )]
    pub async fn publish_with_options(
        &self,
        message: OutgoingMessage,
        routing_key: Option<&str>,
        options: PublishOptions,
    ) -> Result<(), Error> {
        let routing_key = self.resolve_routing_key(routing_key)?;
        let channel = self.current_channel().ok_or_else(|| {
            Error::NotStarted(format!(
                "The publisher for exchange `{}`",
                self.spec.exchange_name
            ))
        })?;
        if !channel.is_open() {
            return Err(Error::ConnectionLost);
        }

        let OutgoingMessage { body, properties } = message;
        let properties = inject_amqp_properties(properties);

        let confirmation = tokio::time::timeout(
            self.spec.publish_timeout,
            channel.basic_publish(
                &self.spec.exchange_name,
                routing_key,
                options,
                &body,
                properties,
            ),
        )
        .await
        .map_err(|_| Error::PublishTimeout)??;

        match confirmation {
            Confirmation::Ack | Confirmation::NotRequested => Ok(()),
            Confirmation::Returned {
                reply_code,
                reply_text,
            } => Err(Error::Unroutable {
                reply_code,
                reply_text,
            }),
            Confirmation::Nack => Err(Error::NegativeAck),
        }
    }

    /// Explicit routing key, then the default one. No network call happens if neither is set.
    fn resolve_routing_key<'a>(&'a self, routing_key: Option<&'a str>) -> Result<&'a str, Error> {
        routing_key
            .or(self.spec.default_routing_key.as_deref())
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "no routing key was provided and the publisher for exchange `{}` has no default routing key",
                    self.spec.exchange_name
                ))
            })
    }

    fn current_channel(&self) -> Option<Arc<dyn Channel>> {
        match self.channel.read() {
            Ok(channel) => channel.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_channel(&self, channel: Option<Arc<dyn Channel>>) -> Option<Arc<dyn Channel>> {
        let mut current = match self.channel.write() {
            Ok(current) => current,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *current, channel)
    }
}

fn inject_amqp_properties(properties: BasicProperties) -> BasicProperties {
    let current_timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|ct| ct.as_secs());

    let props = if let Some(ct) = current_timestamp {
        let ts = *properties.timestamp();
        properties.with_timestamp(ts.unwrap_or(ct))
    } else {
        warn!("System time is before 1970");
        properties
    };

    let delivery_mode = props.delivery_mode().unwrap_or(PERSISTENT);
    let message_id = props.message_id().clone();
    props
        .with_delivery_mode(delivery_mode)
        .with_message_id(message_id.unwrap_or_else(|| Uuid::new_v4().to_string().into()))
}
