use crate::amqp::convenience::set_header;
use amq_protocol_types::{AMQPValue, ShortShortUInt, ShortString};
use lapin::BasicProperties;

/// AMQP delivery mode for messages that must survive a broker restart.
pub(crate) const PERSISTENT: ShortShortUInt = 2;

/// A message to be published via [`Publisher`](crate::publishers::Publisher).
///
/// The exchange is owned by the publisher; the routing key is resolved at publishing time.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OutgoingMessage {
    /// The body of the message - as a sequence of bytes.
    pub body: Vec<u8>,
    /// AMQP properties and headers attached to the message.
    pub properties: BasicProperties,
}

impl OutgoingMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            properties: BasicProperties::default(),
        }
    }

    /// Replace all the AMQP properties of the message.
    #[must_use]
    pub fn with_properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Set a single header, keeping the other ones.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: AMQPValue) -> Self {
        self.properties = set_header(self.properties, name, value);
        self
    }

    fn props(mut self, f: impl FnOnce(BasicProperties) -> BasicProperties) -> Self {
        self.properties = f(self.properties);
        self
    }

    #[must_use]
    pub fn with_content_type(self, value: &str) -> Self {
        self.props(|p| p.with_content_type(ShortString::from(value)))
    }

    #[must_use]
    pub fn with_correlation_id(self, value: &str) -> Self {
        self.props(|p| p.with_correlation_id(ShortString::from(value)))
    }

    #[must_use]
    pub fn with_message_id(self, value: &str) -> Self {
        self.props(|p| p.with_message_id(ShortString::from(value)))
    }

    #[must_use]
    pub fn with_priority(self, value: ShortShortUInt) -> Self {
        self.props(|p| p.with_priority(value))
    }

    /// Per-message TTL, in milliseconds.
    #[must_use]
    pub fn with_expiration(self, milliseconds: u64) -> Self {
        self.props(|p| p.with_expiration(ShortString::from(milliseconds.to_string())))
    }

    /// Transient messages are lost if the broker restarts. Messages are persistent by default.
    #[must_use]
    pub fn transient(self) -> Self {
        self.props(|p| p.with_delivery_mode(1))
    }
}
