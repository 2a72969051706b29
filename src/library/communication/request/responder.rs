use super::super::super::BoxedError;
use super::super::broker::{
    AckMode, Broker, Delivery, DeliveryTag, Message, QueueOptions, DEFAULT_EXCHANGE,
};
use super::super::BrokerError;
use super::{MissingMetadata, Reply, Request};
use async_trait::async_trait;
use futures::StreamExt;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

const DEFAULT_PREFETCH: u16 = 1;

/// Error that may be returned while working on a request
#[derive(Error, Debug)]
pub enum WorkError {
    /// The request can not be understood
    #[error("malformed request: {0}")]
    MalformedInput(String),
    /// The request is understood but no result could be computed for it
    #[error("computation failed")]
    ComputationFailed(#[source] BoxedError),
}

impl From<MissingMetadata> for WorkError {
    fn from(error: MissingMetadata) -> Self {
        WorkError::MalformedInput(error.to_string())
    }
}

/// Structure which turns request payloads into reply payloads
#[async_trait]
pub trait RequestProcessor {
    /// Handler for requests, returning the body of the reply
    async fn process(&self, body: &[u8]) -> Result<Vec<u8>, WorkError>;
}

/// What to do with requests that can not be worked on
///
/// Retrying a request that failed deterministically makes it fail again, so by default
/// such requests are acknowledged and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MalformedInputPolicy {
    /// Acknowledge and drop the request
    #[default]
    Reject,
    /// Put the request back into the queue for redelivery
    Requeue,
}

impl fmt::Display for MalformedInputPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MalformedInputPolicy::Reject => write!(f, "reject"),
            MalformedInputPolicy::Requeue => write!(f, "requeue"),
        }
    }
}

impl FromStr for MalformedInputPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reject" => Ok(MalformedInputPolicy::Reject),
            "requeue" => Ok(MalformedInputPolicy::Requeue),
            other => Err(format!(
                "unknown policy '{}', expected 'reject' or 'requeue'",
                other
            )),
        }
    }
}

/// Snapshot of the counters kept by a [`Responder`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerStats {
    /// Requests answered and acknowledged
    pub processed: u64,
    /// Requests dropped because they could not be worked on
    pub rejected: u64,
    /// Requests handed back to the broker for redelivery
    pub requeued: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    rejected: AtomicU64,
    requeued: AtomicU64,
}

enum Outcome {
    Processed,
    Rejected,
    Requeued,
    Unsettled,
}

/// Worker side of the request-reply protocol
///
/// Consumes a request queue with manual acknowledgement, runs every request through a
/// [`RequestProcessor`] and publishes the result to the queue named in the request. Up to
/// `prefetch` requests are worked on concurrently, a request is only acknowledged once its
/// reply has been handed to the broker.
pub struct Responder<B, P> {
    broker: B,
    processor: P,
    queue: String,
    prefetch: u16,
    policy: MalformedInputPolicy,
    counters: Counters,
}

impl<B, P> Responder<B, P>
where
    B: Broker,
    P: RequestProcessor + Send + Sync,
{
    /// Creates a new responder for the given queue with a prefetch limit of one
    pub fn new(broker: B, processor: P, queue: impl Into<String>) -> Self {
        Self {
            broker,
            processor,
            queue: queue.into(),
            prefetch: DEFAULT_PREFETCH,
            policy: MalformedInputPolicy::default(),
            counters: Counters::default(),
        }
    }

    /// Limits the number of requests worked on at the same time, zero is treated as one
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    /// Changes how requests that can not be worked on are treated
    pub fn with_malformed_policy(mut self, policy: MalformedInputPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Queue requests are consumed from
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Current values of the request counters
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            processed: self.counters.processed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            requeued: self.counters.requeued.load(Ordering::Relaxed),
        }
    }

    /// Declares the request queue and works on requests until the delivery stream ends
    ///
    /// Failures of individual requests never end the loop. Only errors while setting up the
    /// consumer are returned.
    #[instrument(skip(self), fields(queue = %self.queue, prefetch = self.prefetch))]
    pub async fn run(&self) -> Result<(), BrokerError> {
        self.broker
            .declare_queue(&self.queue, QueueOptions::default())
            .await?;

        let stream = self
            .broker
            .consume(&self.queue, AckMode::Manual, self.prefetch)
            .await?;

        info!("Awaiting requests");

        stream
            .for_each_concurrent(Some(usize::from(self.prefetch)), |item| async move {
                match item {
                    Ok(delivery) => {
                        let outcome = self.handle(delivery).await;
                        self.count(outcome);
                    }
                    Err(e) => warn!(error = %e, "Failed to receive request"),
                }
            })
            .await;

        debug!("Request stream ended");

        Ok(())
    }

    fn count(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Processed => &self.counters.processed,
            Outcome::Rejected => &self.counters.rejected,
            Outcome::Requeued => &self.counters.requeued,
            Outcome::Unsettled => return,
        };

        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[instrument(skip(self, delivery), fields(tag = %delivery.tag, redelivered = delivery.redelivered))]
    async fn handle(&self, delivery: Delivery) -> Outcome {
        let Delivery { tag, message, .. } = delivery;

        let request = match Request::try_from(message) {
            Ok(request) => request,
            Err(e) => return self.refuse(tag, e.into()).await,
        };

        let body = match self.processor.process(request.body()).await {
            Ok(body) => body,
            Err(e) => return self.refuse(tag, e).await,
        };

        debug!(correlation_id = %request.correlation_id(), reply_to = %request.reply_to(), "Sending reply");

        let reply = Reply::new(request.correlation_id().clone(), body);
        if let Err(e) = self
            .broker
            .publish(DEFAULT_EXCHANGE, request.reply_to(), Message::from(reply))
            .await
        {
            warn!(error = %e, "Failed to publish reply, requeueing request");
            return self.settle(tag, Some(true)).await;
        }

        self.settle(tag, None).await
    }

    async fn refuse(&self, tag: DeliveryTag, error: WorkError) -> Outcome {
        match self.policy {
            MalformedInputPolicy::Reject => {
                warn!(%error, "Dropping request");
                self.settle(tag, Some(false)).await
            }
            MalformedInputPolicy::Requeue => {
                warn!(%error, "Requeueing request");
                self.settle(tag, Some(true)).await
            }
        }
    }

    /// Acknowledges a delivery (`None`) or rejects it with the given requeue flag
    async fn settle(&self, tag: DeliveryTag, nack: Option<bool>) -> Outcome {
        let (result, outcome) = match nack {
            None => (self.broker.ack(tag).await, Outcome::Processed),
            Some(false) => (self.broker.ack(tag).await, Outcome::Rejected),
            Some(true) => (self.broker.nack(tag, true).await, Outcome::Requeued),
        };

        match result {
            Ok(()) => outcome,
            Err(e) => {
                // The broker hands the request out again once this consumer goes away
                error!(error = %e, "Failed to settle request");
                Outcome::Unsettled
            }
        }
    }
}
