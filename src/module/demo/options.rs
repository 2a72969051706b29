use crate::library::helpers::parse_seconds;
use std::time::Duration;
use structopt::StructOpt;

/// Options for the demo module
#[derive(Debug, StructOpt)]
pub struct Options {
    /// Positions in the counting sequence to request concurrently
    #[structopt(value_name = "n")]
    pub positions: Vec<String>,

    /// Maximum number of requests the worker handles at the same time
    #[structopt(long, default_value = "1")]
    pub prefetch: u16,

    /// Number of seconds to wait for each reply
    #[structopt(long, default_value = "5", parse(try_from_str = parse_seconds), value_name = "secs")]
    pub timeout: Duration,
}
