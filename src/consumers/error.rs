use std::fmt;

/// The error type returned by message handlers.
///
/// It tells the framework how the failed message should be settled with the broker.
#[derive(Debug)]
pub struct HandlerError {
    /// The underlying error returned by the message handler.
    pub inner_error: anyhow::Error,
    /// `error_type` distinguishes two classes of errors:
    /// - transient errors; message processing might succeed if retried after a short delay
    /// - fatal errors; no matter how many times you retry, processing will never succeed
    ///
    /// Check out [`ErrorType`]'s documentation for more details.
    pub error_type: ErrorType,
}

impl HandlerError {
    /// A failure that might go away if the message is processed again later.
    pub fn transient(error: impl Into<anyhow::Error>) -> Self {
        Self {
            inner_error: error.into(),
            error_type: ErrorType::Transient,
        }
    }

    /// A failure that will happen again no matter how many times the message is retried.
    pub fn fatal(error: impl Into<anyhow::Error>) -> Self {
        Self {
            inner_error: error.into(),
            error_type: ErrorType::Fatal,
        }
    }
}

/// Any error can be returned from a handler using `?`: it is classified as transient.
impl<E> From<E> for HandlerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(e: E) -> Self {
        Self::transient(e)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Handling of a message failed due to a {} issue.\n{:?}",
            self.error_type, self.inner_error
        )
    }
}

/// Types of failure when handling a message.
/// Used by the framework to decide between requeueing, dead-lettering and discarding.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorType {
    /// Message processing might succeed if retried after a short delay.
    ///
    /// E.g. the message handler encountered a time out when trying to call an API to fulfill
    /// the message processing requirements.
    ///
    /// The [transient error hook](crate::consumers::ConsumerTransientErrorHook) decides
    /// if the message is requeued.
    Transient,
    /// Message processing will never succeed, no matter how many times you retry or how long
    /// you wait.
    ///
    /// E.g. the message payload is malformed and cannot be deserialized.
    ///
    /// The message will be rejected without requeueing: it ends up in the dead letter exchange,
    /// if one is configured.
    Fatal,
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}
