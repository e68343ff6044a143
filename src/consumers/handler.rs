//! The `Handler` trait is heavily inspired by `tide`'s approach to endpoint handlers.
use crate::consumers::{HandlerError, IncomingMessage};
use std::future::Future;

/// Implementers of the `Handler` trait can be used in our RabbitMq [`MessageHandler`]s
/// to process messages retrieved from a queue.
///
/// # Scope
///
/// `handle` does not get access to the underlying RabbitMq channel.
/// It can settle the message explicitly via [`IncomingMessage::ack`], [`IncomingMessage::nack`]
/// or [`IncomingMessage::reject`]; if it doesn't, the framework takes care of it according to the
/// outcome of processing (check out [`HandlerError`] for more details).
///
/// # Implementers
///
/// While you can implement `Handler` for a struct or enum, most of the time you will be relying
/// on [`ClosureHandler`], our implementation of `Handler` for async functions that have a
/// matching signature - `Fn(IncomingMessage) -> Fut`.
///
/// [`MessageHandler`]: crate::consumers::MessageHandler
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, message: IncomingMessage) -> Result<(), HandlerError>;
}

/// Implement the [`Handler`] trait for all Boxed handlers.
///
/// E.g. Box<dyn Handler>.
#[async_trait::async_trait]
impl<H> Handler for Box<H>
where
    H: Handler + ?Sized,
{
    async fn handle(&self, message: IncomingMessage) -> Result<(), HandlerError> {
        H::handle(self, message).await
    }
}

/// Wrapper type to turn an async function into a [`Handler`].
///
/// We do not require handlers to return a [`HandlerError`] directly - it is enough for them to
/// return an error type that can be converted to [`HandlerError`].
/// [`ConsumerSpecBuilder::handler`](crate::consumers::ConsumerSpecBuilder::handler) performs
/// the wrapping for you.
pub struct ClosureHandler<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut, Err> Handler for ClosureHandler<F>
where
    F: Fn(IncomingMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Err>> + Send + 'static,
    Err: Into<HandlerError> + 'static,
{
    async fn handle(&self, message: IncomingMessage) -> Result<(), HandlerError> {
        (self.0)(message).await.map_err(Into::into)
    }
}
