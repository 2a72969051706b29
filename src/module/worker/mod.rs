//! Answers counting sequence requests arriving on a queue

mod options;

use crate::domain::sequence::SequenceProcessor;
use crate::harness::{Heart, HeartStone, JobScheduler, Module};
use crate::library::communication::broker::SharedBroker;
use crate::library::communication::request::{RequestProcessor, Responder, WorkError};
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use tracing::info;

pub use options::Options;

/// Processor that keeps the heart of the module alive while requests keep coming in
struct Rejuvenating<P> {
    inner: P,
    stone: HeartStone,
}

#[async_trait]
impl<P> RequestProcessor for Rejuvenating<P>
where
    P: RequestProcessor + Send + Sync,
{
    async fn process(&self, body: &[u8]) -> Result<Vec<u8>, WorkError> {
        self.stone.clone().reset_lifetime().await;
        self.inner.process(body).await
    }
}

/// Module implementation
pub struct Worker {
    options: Options,
    broker: Option<SharedBroker>,
}

impl Worker {
    /// Creates a new instance from raw parts
    pub fn new(options: Options) -> Self {
        Self {
            options,
            broker: None,
        }
    }
}

#[async_trait]
impl Module for Worker {
    async fn pre_startup(&mut self) -> EmptyResult {
        self.broker = Some(self.options.broker.connect().await?);
        Ok(())
    }

    async fn run(&mut self, scheduler: &JobScheduler) -> Result<Option<Heart>, BoxedError> {
        let broker = self.broker.take().ok_or("broker not connected")?;
        let (heart, stone) = Heart::with_optional_lifetime(self.options.idle_timeout);

        let processor = Rejuvenating {
            inner: SequenceProcessor,
            stone: stone.clone(),
        };

        let responder = Responder::new(broker, processor, &self.options.queue)
            .with_prefetch(self.options.prefetch)
            .with_malformed_policy(self.options.malformed);

        scheduler.spawn_job("responder", move |token| async move {
            let mut stone = stone;

            let result = tokio::select! {
                result = responder.run() => result,
                _ = token.cancelled() => Ok(()),
            };

            info!(stats = ?responder.stats(), "Responder stopped");

            if !token.is_cancelled() {
                stone.kill("request stream ended").await;
            }

            result.map_err(Into::into)
        });

        Ok(Some(heart))
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::harness::DeathReason;
    use std::time::Duration;
    use tokio::time::Instant;

    struct Constant;

    #[async_trait]
    impl RequestProcessor for Constant {
        async fn process(&self, _: &[u8]) -> Result<Vec<u8>, WorkError> {
            Ok(b"42".to_vec())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn postpone_idle_timeout_on_requests() {
        let lifetime = Duration::from_secs(10);
        let (mut heart, stone) = Heart::with_lifetime(lifetime);
        let processor = Rejuvenating {
            inner: Constant,
            stone,
        };
        let started = Instant::now();

        let death = tokio::spawn(async move { heart.death().await });

        tokio::time::sleep(Duration::from_secs(8)).await;
        assert_eq!(processor.process(b"1").await.unwrap(), b"42");

        assert_eq!(death.await.unwrap(), DeathReason::LifetimeExceeded);
        assert!(started.elapsed() >= Duration::from_secs(18));
    }
}
