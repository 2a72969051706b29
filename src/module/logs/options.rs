use crate::module::options::BrokerOptions;
use structopt::StructOpt;

/// Options for the listen module
#[derive(Debug, StructOpt)]
pub struct ListenOptions {
    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub broker: BrokerOptions,

    /// Fanout exchange to subscribe to
    #[structopt(long, env = "EXCHANGE", default_value = "logs")]
    pub exchange: String,
}

/// Options for the emit module
#[derive(Debug, StructOpt)]
pub struct EmitOptions {
    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub broker: BrokerOptions,

    /// Fanout exchange to publish to
    #[structopt(long, env = "EXCHANGE", default_value = "logs")]
    pub exchange: String,

    /// Words making up the log line, defaults to "hello world"
    #[structopt(value_name = "message")]
    pub message: Vec<String>,
}
