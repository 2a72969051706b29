//! This library crate contains everything needed to run request/reply workloads on top of a message broker.
//!
//! Submodules form a chain of dependencies from the low-level, broker agnostic [`library`], over the
//! [`domain`] specific unit of work, through the executable [`harness`], up to the runnable [`modules`](module).

#![deny(missing_docs)]

pub mod domain;
pub mod harness;
pub mod library;
pub mod module;
