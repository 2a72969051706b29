//! Runs a worker and a client against an in-process broker
//!
//! Useful to see the protocol in action without any infrastructure. Every request is sent
//! concurrently by its own client, each with a private reply queue, and answered by a single worker.

mod options;

use crate::domain::sequence::SequenceProcessor;
use crate::domain::REQUEST_QUEUE;
use crate::harness::{Heart, JobScheduler, Module};
use crate::library::communication::implementation::memory::MemoryBroker;
use crate::library::communication::request::{Requestor, Responder, RpcError};
use crate::library::BoxedError;
use async_trait::async_trait;
use futures::future::join_all;
use tracing::{error, info};

pub use options::Options;

const DEFAULT_POSITION: &str = "10";

/// Module implementation
pub struct Demo {
    options: Options,
    results: Vec<(String, Result<String, RpcError>)>,
}

impl Demo {
    /// Creates a new instance from raw parts
    pub fn new(options: Options) -> Self {
        Self {
            options,
            results: Vec::new(),
        }
    }

    /// Outcome of every request sent by the last run, in the order they were given
    pub fn results(&self) -> &[(String, Result<String, RpcError>)] {
        &self.results
    }

    fn positions(&self) -> Vec<String> {
        if self.options.positions.is_empty() {
            vec![DEFAULT_POSITION.to_owned()]
        } else {
            self.options.positions.clone()
        }
    }
}

#[async_trait]
impl Module for Demo {
    async fn run(&mut self, scheduler: &JobScheduler) -> Result<Option<Heart>, BoxedError> {
        let broker = MemoryBroker::new();

        let responder = Responder::new(broker.clone(), SequenceProcessor, REQUEST_QUEUE)
            .with_prefetch(self.options.prefetch);

        scheduler.spawn_job("responder", move |token| async move {
            tokio::select! {
                result = responder.run() => result?,
                _ = token.cancelled() => {},
            }

            info!(stats = ?responder.stats(), "Responder stopped");
            Ok(())
        });

        let positions = self.positions();
        let timeout = self.options.timeout;

        let mut clients = Vec::with_capacity(positions.len());
        for _ in &positions {
            clients.push(Requestor::new(broker.clone(), REQUEST_QUEUE).await?);
        }

        let calls = clients
            .iter()
            .zip(&positions)
            .map(|(client, n)| client.call(n.as_bytes(), timeout));
        let replies = join_all(calls).await;

        let mut failures = 0;
        self.results = positions
            .into_iter()
            .zip(replies)
            .map(|(n, reply)| {
                let outcome = reply.map(|reply| reply.text().into_owned());

                match &outcome {
                    Ok(value) => println!("{} -> {}", n, value),
                    Err(e) => {
                        failures += 1;
                        error!(%n, error = %e, "Request failed");
                    }
                }

                (n, outcome)
            })
            .collect();

        if failures > 0 {
            return Err(format!("{} of {} requests failed", failures, self.results.len()).into());
        }

        Ok(None)
    }
}
