use crate::transport::TransportError;
use std::time::Duration;

/// The error type returned by the lifecycle operations of [`Broker`](crate::Broker),
/// [`Consumer`](crate::consumers::Consumer) and [`Publisher`](crate::publishers::Publisher).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Timed out after {0:?} while trying to connect to RabbitMq")]
    ConnectTimeout(Duration),
    /// Authentication or protocol failure while establishing the connection.
    #[error("Failed to connect to RabbitMq")]
    Connection(#[source] TransportError),
    /// The operation was attempted on a connection or channel that is no longer open.
    #[error("The connection to RabbitMq is no longer open")]
    ConnectionLost,
    #[error("{0} has not been started")]
    NotStarted(String),
    #[error("The broker is not connected - `connect` must succeed before calling `start`")]
    NotConnected,
    #[error("The broker has already been started")]
    AlreadyStarted,
    /// Invalid registration or publishing parameters - e.g. conflicting declaration flags or
    /// no resolvable routing key.
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    /// The broker rejected the declaration of an exchange, a queue or a binding.
    #[error("RabbitMq rejected the declaration of {object} `{name}`")]
    Declaration {
        object: &'static str,
        name: String,
        #[source]
        source: TransportError,
    },
    #[error("The timeout threshold was reached while trying to publish the message")]
    PublishTimeout,
    #[error("The message could not be routed ({reply_code}: {reply_text})")]
    Unroutable { reply_code: u16, reply_text: String },
    #[error("The RabbitMq broker nacked the publishing of the message")]
    NegativeAck,
    /// Some consumers failed to start. Their siblings, if any, are consuming.
    #[error("{} consumer(s) failed to start", .0.len())]
    ConsumersNotStarted(Vec<ConsumerStartFailure>),
    #[error("Generic error encountered when interacting with the RabbitMq broker")]
    Transport(#[source] TransportError),
}

/// A consumer that could not be started by [`Broker::start`](crate::Broker::start).
#[derive(Debug)]
pub struct ConsumerStartFailure {
    pub queue_name: String,
    pub error: Error,
}

impl Error {
    pub(crate) fn declaration(object: &'static str, name: &str, source: TransportError) -> Self {
        match source {
            TransportError::Closed => Self::ConnectionLost,
            source => Self::Declaration {
                object,
                name: name.to_owned(),
                source,
            },
        }
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => Self::ConnectionLost,
            err => Self::Transport(err),
        }
    }
}
