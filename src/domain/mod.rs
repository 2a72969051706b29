//! Domain specific structures, implementations, and logic

/// Queue requests for the counting sequence are sent to
pub const REQUEST_QUEUE: &str = "rpc_queue";

/// Fanout exchange log lines are broadcast on
pub const LOG_EXCHANGE: &str = "logs";

pub mod sequence;
