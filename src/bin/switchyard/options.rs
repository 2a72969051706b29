use std::str::FromStr;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(about = "Remote procedure calls over a message broker, matched by correlation id.")]
pub struct MainOptions {
    /// Log level, scopable to different modules
    ///
    /// Levels: trace, debug, info, warn, error
    #[structopt(
        short,
        long,
        global = true,
        default_value = "info",
        env = "RUST_LOG",
        value_name = "level"
    )]
    pub log: String,

    /// Format of the log output
    ///
    /// Variants: text, compact, json
    #[structopt(long, global = true, default_value = "text", env = "LOG_FORMAT")]
    pub log_format: LogFormat,

    #[structopt(subcommand)]
    pub command: Command,
}

#[derive(Debug, StructOpt)]
pub enum Command {
    /// Answer requests arriving on a queue
    Worker(switchyard::module::worker::Options),
    /// Send a single request and print the reply
    Call(switchyard::module::client::Options),
    /// Print every line broadcast on a fanout exchange
    Listen(switchyard::module::logs::ListenOptions),
    /// Broadcast a line on a fanout exchange
    Emit(switchyard::module::logs::EmitOptions),
    /// Run worker and client against an in-process broker
    Demo(switchyard::module::demo::Options),
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Text,
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(LogFormat::Text),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}
