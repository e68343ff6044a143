use crate::consumers::IncomingMessage;

#[async_trait::async_trait]
/// A hook to determine if messages that failed due to a transient error should be requeued.
///
/// # Use case
///
/// The framework never acks a message whose processing returned an error or panicked.
/// By default, those messages are never requeued: they are nacked and routed to the dead letter
/// exchange of the queue, if one is configured. This avoids poison messages looping forever.
///
/// If the error encountered during processing is marked as [`ErrorType::Transient`]
/// (or the handler panicked) you can inject your own logic to determine if the failed message
/// should be requeued using a transient error hook.
///
/// # On fatal errors
///
/// A transient error hook, as the name implies, is only invoked on transient errors.
/// Errors marked as [`ErrorType::Fatal`] are rejected and never requeued.
///
/// # Plug and play implementations
///
/// You can find two ready-to-go hooks in the [`hooks::transient_error`] module -
/// [`AlwaysRequeue`] and [`NeverRequeue`].
///
/// [`ErrorType::Transient`]: crate::consumers::ErrorType::Transient
/// [`ErrorType::Fatal`]: crate::consumers::ErrorType::Fatal
/// [`hooks::transient_error`]: crate::consumers::hooks::transient_error
/// [`AlwaysRequeue`]: crate::consumers::hooks::transient_error::AlwaysRequeue
/// [`NeverRequeue`]: crate::consumers::hooks::transient_error::NeverRequeue
pub trait ConsumerTransientErrorHook: Send + Sync + 'static {
    /// If [`ShouldRequeue::Requeue`] is returned, the message will be requeued and become
    /// _immediately_ available again for consumption.
    /// If [`ShouldRequeue::DeadLetterOrDiscard`] is returned, the message will not be requeued
    /// and it will end up in the dead letter exchange if configured.
    async fn on_transient_error(&self, message: &IncomingMessage) -> ShouldRequeue;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Determines if a failed message should be re-queued.
///
/// Check out [`ConsumerTransientErrorHook`]'s documentation for more details.
pub enum ShouldRequeue {
    Requeue,
    DeadLetterOrDiscard,
}
