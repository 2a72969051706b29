use crate::library::helpers::parse_seconds;
use crate::module::options::BrokerOptions;
use std::time::Duration;
use structopt::StructOpt;

/// Options for the client module
#[derive(Debug, StructOpt)]
pub struct Options {
    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub broker: BrokerOptions,

    /// Position in the counting sequence to request
    #[structopt(value_name = "n")]
    pub position: String,

    /// Queue to send the request to
    #[structopt(long, env = "QUEUE", default_value = "rpc_queue")]
    pub queue: String,

    /// Number of seconds to wait for the reply
    #[structopt(long, default_value = "5", parse(try_from_str = parse_seconds), value_name = "secs")]
    pub timeout: Duration,
}
