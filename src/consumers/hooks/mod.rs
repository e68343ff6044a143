//! Ready-to-use hooks to customise the behaviour of consumers.
pub mod transient_error;
