use super::super::broker::{
    AckMode, Broker, DeliveryStream, Message, QueueOptions, DEFAULT_EXCHANGE,
};
use super::super::BrokerError;
use super::{CorrelationId, CorrelationRegistry, PendingCall, Reply, Request};
use futures::StreamExt;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Error type for remote procedure calls
#[derive(Error, Debug)]
pub enum RpcError {
    /// Another pending call already uses the identifier
    #[error("correlation id {0} is already in use")]
    DuplicateId(CorrelationId),
    /// No reply arrived before the deadline
    #[error("no reply for {correlation_id} within {after:?}")]
    Timeout {
        /// Identifier of the expired call
        correlation_id: CorrelationId,
        /// Time the caller was willing to wait
        after: Duration,
    },
    /// The caller gave up before a reply arrived
    #[error("call cancelled")]
    Cancelled,
    /// The request could not be handed to the broker
    #[error("broker failure")]
    Broker(#[from] BrokerError),
}

/// Client side of the request-reply protocol
///
/// Every requestor owns a private, broker-named reply queue which is consumed by a background
/// task feeding replies into a [`CorrelationRegistry`]. Any number of calls may be in flight
/// concurrently, each one being matched to its reply by a fresh [`CorrelationId`].
/// The reply listener is stopped when the requestor is dropped. Should the reply stream end
/// on its own, all pending and future calls fail with [`BrokerError::Closed`].
pub struct Requestor<B> {
    broker: B,
    queue: String,
    reply_queue: String,
    registry: CorrelationRegistry,
    listener: JoinHandle<()>,
}

impl<B> Requestor<B>
where
    B: Broker,
{
    /// Sets up a reply queue and starts listening on it
    ///
    /// Requests are sent to `queue` through the default exchange. The queue is declared as well,
    /// so that requests published before the first worker comes up are not lost.
    #[instrument(skip(broker))]
    pub async fn new(broker: B, queue: &str) -> Result<Self, BrokerError> {
        broker.declare_queue(queue, QueueOptions::default()).await?;

        let reply_queue = broker
            .declare_queue("", QueueOptions::private())
            .await?
            .name()
            .to_owned();

        let stream = broker.consume(&reply_queue, AckMode::Auto, 0).await?;
        let registry = CorrelationRegistry::new();
        let listener = tokio::spawn(listen(stream, registry.clone(), reply_queue.clone()));

        debug!(%reply_queue, "Listening for replies");

        Ok(Self {
            broker,
            queue: queue.to_owned(),
            reply_queue,
            registry,
            listener,
        })
    }

    /// Queue requests are published to
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Private queue replies are received on
    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Calls that are currently waiting for a reply
    pub fn registry(&self) -> &CorrelationRegistry {
        &self.registry
    }

    /// Sends a request and waits at most `timeout` for the reply
    pub async fn call(
        &self,
        body: impl Into<Vec<u8>>,
        timeout: Duration,
    ) -> Result<Reply, RpcError> {
        let deadline = Instant::now() + timeout;
        let pending = self.dispatch(body.into()).await?;

        pending.wait(deadline).await
    }

    /// Like [`call`](Requestor::call) but gives up early once `token` is cancelled
    pub async fn call_with_cancellation(
        &self,
        body: impl Into<Vec<u8>>,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<Reply, RpcError> {
        let deadline = Instant::now() + timeout;
        let pending = self.dispatch(body.into()).await?;

        pending.wait_or_cancel(deadline, token.cancelled()).await
    }

    async fn dispatch(&self, body: Vec<u8>) -> Result<PendingCall, RpcError> {
        // Register before publishing so that an immediate reply can not overtake the registration
        let pending = self.registry.register(CorrelationId::generate())?;
        let request = Request::new(body, pending.correlation_id().clone(), &self.reply_queue);

        debug!(correlation_id = %pending.correlation_id(), queue = %self.queue, "Sending request");

        // Dropping the pending call on failure purges it from the registry
        self.broker
            .publish(DEFAULT_EXCHANGE, &self.queue, Message::from(request))
            .await?;

        Ok(pending)
    }
}

impl<B> Drop for Requestor<B> {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn listen(mut stream: DeliveryStream, registry: CorrelationRegistry, queue: String) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(delivery) => match Reply::try_from(delivery.message) {
                Ok(reply) => {
                    registry.resolve(reply);
                }
                Err(error) => warn!(%queue, %error, "Discarding uncorrelated reply"),
            },
            Err(error) => warn!(%queue, %error, "Failed to receive reply"),
        }
    }

    warn!(%queue, pending = registry.len(), "Reply stream ended, failing calls");
    registry.close();
}

#[cfg(test)]
mod does {
    use super::super::super::broker::Delivery;
    use super::super::super::implementation::memory::MemoryBroker;
    use super::super::faulty::Faulty;
    use super::super::Resolution;
    use super::*;
    use futures::future::join;
    use pretty_assertions::assert_eq;

    const QUEUE: &str = "rpc_queue";

    /// Takes the next request off the queue
    async fn next_request(stream: &mut DeliveryStream) -> (Delivery, Request) {
        let delivery = stream.next().await.unwrap().unwrap();
        let request = Request::try_from(delivery.message.clone()).unwrap();
        (delivery, request)
    }

    async fn answer(broker: &MemoryBroker, request: &Request, body: &str) {
        let reply = Reply::new(request.correlation_id().clone(), body);
        broker
            .publish(DEFAULT_EXCHANGE, request.reply_to(), Message::from(reply))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn match_reply_by_correlation_id() {
        let broker = MemoryBroker::new();
        let requestor = Requestor::new(broker.clone(), QUEUE).await.unwrap();
        let mut requests = broker.consume(QUEUE, AckMode::Auto, 0).await.unwrap();

        let server = async {
            let (_, request) = next_request(&mut requests).await;
            assert_eq!(request.body(), b"10");
            assert_eq!(request.reply_to(), requestor.reply_queue());

            answer(&broker, &request, "34").await;
            request
        };

        let (reply, request) = join(requestor.call("10", Duration::from_secs(5)), server).await;
        let reply = reply.unwrap();

        assert_eq!(reply.text(), "34");
        assert_eq!(reply.correlation_id(), request.correlation_id());
        assert!(requestor.registry().is_empty());
    }

    #[tokio::test]
    async fn keep_concurrent_calls_apart() {
        let broker = MemoryBroker::new();
        let requestor = Requestor::new(broker.clone(), QUEUE).await.unwrap();
        let mut requests = broker.consume(QUEUE, AckMode::Auto, 0).await.unwrap();

        let server = async {
            let (_, first) = next_request(&mut requests).await;
            let (_, second) = next_request(&mut requests).await;

            // Answer in reverse order
            for request in [&second, &first] {
                let body = format!("re: {}", String::from_utf8_lossy(request.body()));
                answer(&broker, request, &body).await;
            }
        };

        let calls = join(
            requestor.call("a", Duration::from_secs(5)),
            requestor.call("b", Duration::from_secs(5)),
        );
        let ((a, b), _) = join(calls, server).await;

        assert_eq!(a.unwrap().text(), "re: a");
        assert_eq!(b.unwrap().text(), "re: b");
    }

    #[tokio::test(start_paused = true)]
    async fn time_out_without_worker() {
        let broker = MemoryBroker::new();
        let requestor = Requestor::new(broker.clone(), QUEUE).await.unwrap();
        let started = Instant::now();

        let result = requestor.call("10", Duration::from_secs(5)).await;

        assert!(matches!(result, Err(RpcError::Timeout { after, .. }) if after == Duration::from_secs(5)));
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(requestor.registry().is_empty());

        // The request is still waiting for a worker
        assert_eq!(broker.queue_depth(QUEUE), Some(1));
    }

    #[tokio::test]
    async fn drop_late_replies_after_cancellation() {
        let broker = MemoryBroker::new();
        let requestor = Requestor::new(broker.clone(), QUEUE).await.unwrap();
        let mut requests = broker.consume(QUEUE, AckMode::Auto, 0).await.unwrap();
        let token = CancellationToken::new();

        let server = async {
            let (_, request) = next_request(&mut requests).await;
            token.cancel();
            request
        };

        let (result, request) = join(
            requestor.call_with_cancellation("10", Duration::from_secs(5), &token),
            server,
        )
        .await;

        assert!(matches!(result, Err(RpcError::Cancelled)));
        assert!(!requestor.registry().contains(request.correlation_id()));

        let late = Reply::new(request.correlation_id().clone(), "34");
        assert_eq!(
            requestor.registry().resolve(late),
            Resolution::Late(request.correlation_id().clone())
        );
    }

    #[tokio::test]
    async fn surface_publish_failures() {
        let broker = Faulty::default().refusing_publishes(usize::MAX);
        let requestor = Requestor::new(broker, QUEUE).await.unwrap();

        let result = requestor.call("10", Duration::from_secs(5)).await;

        assert!(matches!(
            result,
            Err(RpcError::Broker(BrokerError::Publish { .. }))
        ));
        assert!(requestor.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fail_calls_once_reply_stream_breaks() {
        let broker = Faulty::default().with_broken_consumers();
        let requestor = Requestor::new(broker, QUEUE).await.unwrap();
        let started = Instant::now();

        let first = requestor.call("10", Duration::from_secs(5)).await;
        let second = requestor.call("10", Duration::from_secs(5)).await;

        assert!(matches!(first, Err(RpcError::Broker(BrokerError::Closed))));
        assert!(matches!(second, Err(RpcError::Broker(BrokerError::Closed))));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(requestor.registry().is_closed());
    }

    #[tokio::test]
    async fn remove_reply_queue_on_drop() {
        let broker = MemoryBroker::new();
        let requestor = Requestor::new(broker.clone(), QUEUE).await.unwrap();
        let reply_queue = requestor.reply_queue().to_owned();

        assert!(broker.has_queue(&reply_queue));
        drop(requestor);

        // Give the aborted listener a chance to release its consumer
        for _ in 0..16 {
            if !broker.has_queue(&reply_queue) {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(!broker.has_queue(&reply_queue));
        assert!(broker.has_queue(QUEUE));
    }
}
