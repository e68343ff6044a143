//! A collection of transient error hooks.

use crate::consumers::{ConsumerTransientErrorHook, IncomingMessage, ShouldRequeue};

/// Never requeue a message that failed with a transient error.
///
/// This is the default hook: failed messages are dead-lettered, if the queue has a dead letter
/// exchange, or discarded.
pub struct NeverRequeue;

#[async_trait::async_trait]
impl ConsumerTransientErrorHook for NeverRequeue {
    async fn on_transient_error(&self, _message: &IncomingMessage) -> ShouldRequeue {
        ShouldRequeue::DeadLetterOrDiscard
    }
}

/// Always requeue a message that failed with a transient error.
///
/// Beware of poison messages: a message that always fails is redelivered forever.
pub struct AlwaysRequeue;

#[async_trait::async_trait]
impl ConsumerTransientErrorHook for AlwaysRequeue {
    async fn on_transient_error(&self, _message: &IncomingMessage) -> ShouldRequeue {
        ShouldRequeue::Requeue
    }
}

