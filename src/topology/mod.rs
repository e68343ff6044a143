//! Exchanges, queues and their declaration flags.
//!
//! ## Examples
//!
//! ```
//! use burrow::topology::{ExchangeDeclaration, ExchangeKind, QueueDeclaration};
//! use burrow::amqp::types::AMQPValue;
//!
//! // A durable topic exchange
//! let exchange = ExchangeDeclaration::durable();
//!
//! // A delayed-message exchange needs to know how to route once the delay expires
//! let delayed = ExchangeDeclaration::durable()
//!     .with_argument("x-delayed-type", AMQPValue::LongString("topic".into()));
//! assert!(delayed.validate("orders.delayed", &ExchangeKind::DelayedMessage).is_ok());
//!
//! // A queue that must already exist
//! let queue = QueueDeclaration::passive();
//! # drop((exchange, queue));
//! ```
mod declaration;
mod exchange_kind;

pub use declaration::{ExchangeDeclaration, QueueDeclaration, DELAYED_TYPE_ARGUMENT};
pub use exchange_kind::{ExchangeKind, UnknownExchangeKind};
