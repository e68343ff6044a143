use crate::consumers::{
    ConsumerTransientErrorHook, ErrorType, HandlerError, IncomingMessage, ShouldRequeue,
};
use crate::Error;

/// The action we asked the broker to take when finalising the processing of
/// the current message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BrokerAction {
    /// Positive acknowledgement - the message can be removed from the queue.
    Ack,
    /// Negative acknowledgement - the message was not processed successfully.
    /// It is requeued or routed to the dead letter exchange (if configured) depending on `requeue`.
    Nack { requeue: bool },
    /// Rejection. The message was not processed successfully and should NOT be requeued.
    /// The message will be sent to the dead letter exchange if configured.
    Reject,
}

impl From<ShouldRequeue> for BrokerAction {
    fn from(should_requeue: ShouldRequeue) -> Self {
        match should_requeue {
            ShouldRequeue::Requeue => Self::Nack { requeue: true },
            ShouldRequeue::DeadLetterOrDiscard => Self::Nack { requeue: false },
        }
    }
}

impl BrokerAction {
    async fn execute(&self, message: &IncomingMessage) -> Result<(), Error> {
        match self {
            Self::Ack => message.ack().await,
            Self::Nack { requeue } => message.nack(*requeue).await,
            Self::Reject => message.reject(false).await,
        }
    }
}

/// Based on the outcome of processing communicate with the AMQP broker to ack/nack/reject the message.
///
/// It returns `None` if there was nothing left to do: the handler already settled the message
/// or the broker auto-acked it on delivery.
pub(crate) async fn settle(
    message: &IncomingMessage,
    outcome: &Result<(), HandlerError>,
    transient_error_hook: &dyn ConsumerTransientErrorHook,
) -> Result<Option<BrokerAction>, Error> {
    if message.is_settled() {
        return Ok(None);
    }
    let action = match outcome {
        Ok(()) => BrokerAction::Ack,
        // Removes the message from the queue, rejecting it.
        // If a dead letter exchange has been configured, the rejected message will be delivered to it.
        Err(e) if e.error_type == ErrorType::Fatal => BrokerAction::Reject,
        Err(_) => transient_error_hook.on_transient_error(message).await.into(),
    };
    action.execute(message).await?;
    Ok(Some(action))
}
