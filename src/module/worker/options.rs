use crate::library::communication::request::MalformedInputPolicy;
use crate::library::helpers::parse_seconds;
use crate::module::options::BrokerOptions;
use std::time::Duration;
use structopt::StructOpt;

/// Options for the worker module
#[derive(Debug, StructOpt)]
pub struct Options {
    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub broker: BrokerOptions,

    /// Queue to consume requests from
    #[structopt(long, env = "QUEUE", default_value = "rpc_queue")]
    pub queue: String,

    /// Maximum number of requests worked on at the same time
    #[structopt(long, env = "PREFETCH", default_value = "1")]
    pub prefetch: u16,

    /// What to do with requests that can not be worked on
    ///
    /// Variants: reject, requeue
    #[structopt(long, env = "MALFORMED", default_value = "reject", value_name = "policy")]
    pub malformed: MalformedInputPolicy,

    /// Shut down after receiving no requests for this many seconds
    #[structopt(long, env = "IDLE_TIMEOUT", parse(try_from_str = parse_seconds), value_name = "secs")]
    pub idle_timeout: Option<Duration>,
}
