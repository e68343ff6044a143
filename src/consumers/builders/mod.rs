mod message_handler;
pub use message_handler::{ConsumerSpec, ConsumerSpecBuilder, MessageHandler};
