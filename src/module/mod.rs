//! Runnable modules each bundling a piece of the protocol and providing a unified configuration

pub mod options;

pub mod client;
pub mod demo;
pub mod logs;
pub mod worker;
