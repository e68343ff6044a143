//! Facilities to consume messages from a RabbitMq queue. Check out [`ConsumerSpec::builder`] as a
//! starting point.
pub use builders::{ConsumerSpec, ConsumerSpecBuilder, MessageHandler};
pub use consumer::{Consumer, ConsumerState, StopOptions};
pub use error::{ErrorType, HandlerError};
pub use handler::{ClosureHandler, Handler};
pub use incoming_message::IncomingMessage;
pub use transient_error_hook::{ConsumerTransientErrorHook, ShouldRequeue};

mod builders;
mod consumer;
mod error;
mod handler;
pub mod hooks;
mod incoming_message;
mod settlement;
mod transient_error_hook;
