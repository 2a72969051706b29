//! Broadcasts log lines to every subscriber of a fanout exchange
//!
//! Each listener declares its own broker-named, private queue and binds it to the exchange, so every
//! running listener receives a copy of each line. Lines are not persisted: listeners only see
//! what has been emitted while they are subscribed.

mod options;

use crate::harness::{Heart, JobScheduler, Module};
use crate::library::communication::broker::{
    AckMode, Broker, DeliveryStream, ExchangeKind, Message, QueueOptions, SharedBroker, TEXT_PLAIN,
};
use crate::library::communication::BrokerError;
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{info, warn};

pub use options::{EmitOptions, ListenOptions};

const DEFAULT_LINE: &str = "hello world";

/// Declares the exchange and subscribes a fresh private queue to it
pub async fn subscribe<B: Broker>(
    broker: &B,
    exchange: &str,
) -> Result<DeliveryStream, BrokerError> {
    broker
        .declare_exchange(exchange, ExchangeKind::Fanout, true)
        .await?;

    let queue = broker.declare_queue("", QueueOptions::private()).await?;
    broker.bind(queue.name(), exchange, "").await?;

    info!(%exchange, queue = queue.name(), "Waiting for log lines");

    broker.consume(queue.name(), AckMode::Auto, 0).await
}

/// Publishes a single line to every queue bound to the exchange
pub async fn emit<B: Broker>(broker: &B, exchange: &str, line: &str) -> Result<(), BrokerError> {
    broker
        .declare_exchange(exchange, ExchangeKind::Fanout, true)
        .await?;

    let message = Message::new(line).with_content_type(TEXT_PLAIN);
    broker.publish(exchange, "", message).await
}

/// Module implementation printing log lines
pub struct Listen {
    options: ListenOptions,
    broker: Option<SharedBroker>,
}

impl Listen {
    /// Creates a new instance from raw parts
    pub fn new(options: ListenOptions) -> Self {
        Self {
            options,
            broker: None,
        }
    }
}

#[async_trait]
impl Module for Listen {
    async fn pre_startup(&mut self) -> EmptyResult {
        self.broker = Some(self.options.broker.connect().await?);
        Ok(())
    }

    async fn run(&mut self, scheduler: &JobScheduler) -> Result<Option<Heart>, BoxedError> {
        let broker = self.broker.take().ok_or("broker not connected")?;
        let mut lines = subscribe(&broker, &self.options.exchange).await?;
        let (heart, mut stone) = Heart::new();

        scheduler.spawn_job("listener", move |token| async move {
            loop {
                tokio::select! {
                    item = lines.next() => match item {
                        Some(Ok(delivery)) => {
                            let line = String::from_utf8_lossy(delivery.message.body());
                            info!(%line, "Received log line");
                        }
                        Some(Err(e)) => warn!(error = %e, "Failed to receive log line"),
                        None => {
                            stone.kill("log stream ended").await;
                            return Ok(());
                        }
                    },
                    _ = token.cancelled() => return Ok(()),
                }
            }
        });

        Ok(Some(heart))
    }
}

/// Module implementation sending a single log line
pub struct Emit {
    options: EmitOptions,
    broker: Option<SharedBroker>,
}

impl Emit {
    /// Creates a new instance from raw parts
    pub fn new(options: EmitOptions) -> Self {
        Self {
            options,
            broker: None,
        }
    }

    fn line(&self) -> String {
        if self.options.message.is_empty() {
            DEFAULT_LINE.to_owned()
        } else {
            self.options.message.join(" ")
        }
    }
}

#[async_trait]
impl Module for Emit {
    async fn pre_startup(&mut self) -> EmptyResult {
        self.broker = Some(self.options.broker.connect().await?);
        Ok(())
    }

    async fn run(&mut self, _scheduler: &JobScheduler) -> Result<Option<Heart>, BoxedError> {
        let broker = self.broker.take().ok_or("broker not connected")?;
        let line = self.line();

        emit(&broker, &self.options.exchange, &line).await?;
        info!(exchange = %self.options.exchange, %line, "Sent log line");

        Ok(None)
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::domain::LOG_EXCHANGE;
    use crate::library::communication::implementation::memory::MemoryBroker;
    use crate::module::options::{BrokerBackend, BrokerOptions, RedisOptions};
    use pretty_assertions::assert_eq;

    async fn next_line(stream: &mut DeliveryStream) -> String {
        let delivery = stream.next().await.unwrap().unwrap();
        String::from_utf8(delivery.message.into_body()).unwrap()
    }

    #[tokio::test]
    async fn copy_lines_to_every_listener() {
        let broker = MemoryBroker::new();
        let mut first = subscribe(&broker, LOG_EXCHANGE).await.unwrap();
        let mut second = subscribe(&broker, LOG_EXCHANGE).await.unwrap();

        emit(&broker, LOG_EXCHANGE, "disk almost full").await.unwrap();

        assert_eq!(next_line(&mut first).await, "disk almost full");
        assert_eq!(next_line(&mut second).await, "disk almost full");
    }

    #[tokio::test]
    async fn drop_lines_without_listeners() {
        let broker = MemoryBroker::new();

        emit(&broker, LOG_EXCHANGE, "nobody hears this").await.unwrap();
        let mut late = subscribe(&broker, LOG_EXCHANGE).await.unwrap();
        emit(&broker, LOG_EXCHANGE, "second").await.unwrap();

        assert_eq!(next_line(&mut late).await, "second");
    }

    #[test]
    fn join_words_into_a_line() {
        let options = |message: Vec<&str>| EmitOptions {
            broker: BrokerOptions {
                backend: BrokerBackend::Memory,
                id: None,
                redis: RedisOptions {
                    url: "redis://127.0.0.1/".into(),
                },
            },
            exchange: LOG_EXCHANGE.into(),
            message: message.into_iter().map(str::to_owned).collect(),
        };

        assert_eq!(Emit::new(options(vec![])).line(), "hello world");
        assert_eq!(Emit::new(options(vec!["a", "b"])).line(), "a b");
    }
}
