//! Facilities to publish messages to a RabbitMq exchange. Check out [`PublisherSpec::builder`]
//! as a starting point.
mod outgoing_message;
mod publisher;

pub use crate::transport::PublishOptions;
pub use outgoing_message::OutgoingMessage;
pub use publisher::{Publisher, PublisherSpec, PublisherSpecBuilder};
