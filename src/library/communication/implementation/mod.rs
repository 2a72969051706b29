//! Implementations of the [`Broker`](super::broker::Broker) trait

pub mod memory;
pub mod redis;
