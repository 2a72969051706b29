use anyhow::{bail, Result};
use options::{Command, LogFormat};
use structopt::StructOpt;
use switchyard::harness::ModuleRunner;
use switchyard::module::client::Client;
use switchyard::module::demo::Demo;
use switchyard::module::logs::{Emit, Listen};
use switchyard::module::worker::Worker;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod options;

#[tokio::main]
async fn main() -> Result<()> {
    let (command, runner) = init()?;

    let reason = match command {
        Command::Worker(options) => runner.run(Worker::new(options)).await,
        Command::Call(options) => runner.run(Client::new(options)).await,
        Command::Listen(options) => runner.run(Listen::new(options)).await,
        Command::Emit(options) => runner.run(Emit::new(options)).await,
        Command::Demo(options) => runner.run(Demo::new(options)).await,
    };

    if reason.is_failure() {
        bail!(reason);
    }

    Ok(())
}

fn init() -> Result<(Command, ModuleRunner)> {
    let options = options::MainOptions::from_args();

    let formatter = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&options.log)?)
        .with_writer(std::io::stderr);

    match options.log_format {
        LogFormat::Text => formatter.init(),
        LogFormat::Compact => formatter.compact().init(),
        LogFormat::Json => formatter.json().init(),
    };

    info!("Switchyard {}", env!("CARGO_PKG_VERSION"));

    Ok((options.command, ModuleRunner::default()))
}
