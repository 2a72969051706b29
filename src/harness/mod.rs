//! Runtime harness to execute modules

mod heart;
mod jobs;
mod module;

pub use heart::*;
pub use jobs::*;
pub use module::*;
