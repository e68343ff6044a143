//! `burrow` is a declarative framework, built on top of [`lapin`], to consume and publish
//! RabbitMQ messages without hand-writing the AMQP plumbing.
//!
//! You describe consumers with [`ConsumerSpec::builder`](crate::consumers::ConsumerSpec::builder)
//! and publishers with [`PublisherSpec::builder`](crate::publishers::PublisherSpec::builder),
//! register them with a [`Broker`] and let it declare the topology, run the consumption loops
//! and settle every delivery according to the outcome of your handler.
//!
//! ## Examples
//!
//! Check the `demos` directory to see the library in action.

pub mod amqp;
pub mod consumers;
pub mod publishers;
pub mod topology;
pub mod transport;

mod broker;
mod error;

pub use broker::{Broker, ConnectionStatus};
pub use error::{ConsumerStartFailure, Error};
