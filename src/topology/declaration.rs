use crate::topology::ExchangeKind;
use crate::Error;
use amq_protocol_types::{AMQPValue, FieldTable};

/// The argument the delayed-message exchange plugin reads to route messages once their delay
/// has expired.
pub const DELAYED_TYPE_ARGUMENT: &str = "x-delayed-type";

const RESERVED_PREFIX: &str = "amq.";

/// How an exchange should be declared against the broker.
///
/// The default is a transient exchange, matching a plain `exchange.declare`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExchangeDeclaration {
    /// The exchange survives a broker restart.
    pub durable: bool,
    /// The exchange is deleted once the last queue is unbound from it.
    pub auto_delete: bool,
    /// Only assert that the exchange exists - fail if it does not.
    pub passive: bool,
    /// The exchange cannot be published to directly, only via exchange-to-exchange bindings.
    pub internal: bool,
    /// Broker-specific extensions - e.g. `x-delayed-type`.
    pub arguments: FieldTable,
}

impl ExchangeDeclaration {
    /// A durable exchange: it survives RabbitMq server restarts.
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Self::default()
        }
    }

    /// Assert that the exchange exists without trying to create it.
    pub fn passive() -> Self {
        Self {
            passive: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    #[must_use]
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    #[must_use]
    pub fn with_argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }

    /// Reject combinations the broker would refuse (or silently ignore) before any I/O happens.
    pub fn validate(&self, name: &str, kind: &ExchangeKind) -> Result<(), Error> {
        if name.is_empty() {
            return Err(Error::Configuration(
                "the default exchange cannot be declared, an exchange name is required".into(),
            ));
        }
        if self.passive {
            if self.durable || self.auto_delete || self.internal {
                return Err(Error::Configuration(format!(
                    "exchange `{name}` is declared passive: durable, auto-delete and internal \
                     flags have no effect and must not be set"
                )));
            }
            if !self.arguments.inner().is_empty() {
                return Err(Error::Configuration(format!(
                    "exchange `{name}` is declared passive: arguments have no effect and must not be set"
                )));
            }
            return Ok(());
        }
        if name.starts_with(RESERVED_PREFIX) {
            return Err(Error::Configuration(format!(
                "exchange `{name}` uses the reserved `{RESERVED_PREFIX}` prefix, it can only be declared passive"
            )));
        }
        if *kind == ExchangeKind::DelayedMessage
            && !self.arguments.contains_key(DELAYED_TYPE_ARGUMENT)
        {
            return Err(Error::Configuration(format!(
                "delayed-message exchange `{name}` requires the `{DELAYED_TYPE_ARGUMENT}` argument"
            )));
        }
        Ok(())
    }
}

/// How a queue should be declared against the broker.
///
/// The default is a transient, shared queue.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueueDeclaration {
    /// The queue survives a broker restart.
    ///
    /// Messages in a durable queue survive a restart only if they were published as persistent.
    pub durable: bool,
    /// The queue is deleted once its last consumer unsubscribes.
    pub auto_delete: bool,
    /// Only assert that the queue exists - fail if it does not.
    pub passive: bool,
    /// The queue is used by only one connection and it is deleted when that connection closes.
    pub exclusive: bool,
    /// Broker-specific extensions - e.g. `x-dead-letter-exchange`, `x-max-priority`.
    pub arguments: FieldTable,
}

impl QueueDeclaration {
    /// A durable queue: it survives RabbitMq server restarts.
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Self::default()
        }
    }

    /// Assert that the queue exists without trying to create it.
    pub fn passive() -> Self {
        Self {
            passive: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    #[must_use]
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    #[must_use]
    pub fn with_argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }

    /// Reject combinations the broker would refuse (or silently ignore) before any I/O happens.
    ///
    /// An empty queue name is allowed for non-passive declarations: the broker generates one.
    pub fn validate(&self, name: &str) -> Result<(), Error> {
        if self.passive {
            if name.is_empty() {
                return Err(Error::Configuration(
                    "a passive queue declaration requires a queue name".into(),
                ));
            }
            if self.durable || self.auto_delete || self.exclusive {
                return Err(Error::Configuration(format!(
                    "queue `{name}` is declared passive: durable, auto-delete and exclusive \
                     flags have no effect and must not be set"
                )));
            }
            if !self.arguments.inner().is_empty() {
                return Err(Error::Configuration(format!(
                    "queue `{name}` is declared passive: arguments have no effect and must not be set"
                )));
            }
            return Ok(());
        }
        if name.starts_with(RESERVED_PREFIX) {
            return Err(Error::Configuration(format!(
                "queue `{name}` uses the reserved `{RESERVED_PREFIX}` prefix, it can only be declared passive"
            )));
        }
        Ok(())
    }
}
