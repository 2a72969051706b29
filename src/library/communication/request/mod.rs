//! Structures to realise a request-reply pattern
//!
//! There are two parties involved:
//!
//! - Requesting side
//! - Responding side
//!
//! On the requesting side, a [`Requestor`] publishes a [`Request`] onto a well-known queue and
//! waits for the matching [`Reply`] on a private reply queue. Outstanding calls are tracked by a
//! [`CorrelationRegistry`] which hands each reply to exactly one waiting caller.
//!
//! On the responding side, a [`Responder`] consumes requests under a bounded prefetch window,
//! runs them through a [`RequestProcessor`] and publishes the result to the queue named in the request.
//!
//! Requests are acknowledged only after their reply has been published. If a worker dies in between,
//! the broker hands the request to another worker and the caller may observe the reply twice, in which
//! case the second one is discarded. For this reason, processing a request may not have side effects.

mod correlation;
#[cfg(test)]
mod faulty;
mod registry;
#[allow(clippy::module_inception)]
mod request;
mod requestor;
mod responder;

pub use correlation::*;
pub use registry::*;
pub use request::*;
pub use requestor::*;
pub use responder::*;
