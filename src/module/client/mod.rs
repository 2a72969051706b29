//! Sends a single request and prints the reply

mod options;

use crate::harness::{Heart, JobScheduler, Module};
use crate::library::communication::broker::SharedBroker;
use crate::library::communication::request::Requestor;
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use tracing::info;

pub use options::Options;

/// Module implementation
pub struct Client {
    options: Options,
    broker: Option<SharedBroker>,
    reply: Option<String>,
}

impl Client {
    /// Creates a new instance from raw parts
    pub fn new(options: Options) -> Self {
        Self {
            options,
            broker: None,
            reply: None,
        }
    }

    /// Body of the reply received by the last run, if any
    pub fn reply(&self) -> Option<&str> {
        self.reply.as_deref()
    }
}

#[async_trait]
impl Module for Client {
    async fn pre_startup(&mut self) -> EmptyResult {
        self.broker = Some(self.options.broker.connect().await?);
        Ok(())
    }

    async fn run(&mut self, _scheduler: &JobScheduler) -> Result<Option<Heart>, BoxedError> {
        let broker = self.broker.take().ok_or("broker not connected")?;
        let requestor = Requestor::new(broker, &self.options.queue).await?;

        info!(n = %self.options.position, "Requesting sequence value");

        let reply = requestor
            .call(self.options.position.as_bytes(), self.options.timeout)
            .await?;

        let text = reply.text().into_owned();
        info!(correlation_id = %reply.correlation_id(), result = %text, "Received reply");
        println!("{}", text);

        self.reply = Some(text);

        Ok(None)
    }
}
