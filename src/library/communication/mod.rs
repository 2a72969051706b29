//! Request and reply on top of a message broker
//!
//! A broker only knows how to move opaque messages between queues. This module adds the
//! conventions needed to turn that into remote procedure calls:
//!
//! 1. The caller publishes a request onto a well-known queue and tags it with a fresh
//!    correlation identifier and the name of a private reply queue.
//! 2. A worker consumes the request, computes a result and publishes a reply to the
//!    queue named in the request, carrying the same correlation identifier.
//! 3. The caller matches incoming replies to outstanding calls by their correlation identifier.
//!
//! The broker itself is abstracted by the [`Broker`](broker::Broker) trait so that the protocol
//! can run on top of different backends (see [`implementation`]). Delivery is at-least-once:
//! a request may be executed more than once if a worker dies before acknowledging it.

mod error;

pub mod broker;
pub mod implementation;
pub mod request;

pub use error::BrokerError;
