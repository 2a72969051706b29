//! In-process [`Broker`] with AMQP-like semantics
//!
//! Supports the default exchange, direct and fanout exchanges, broker-named queues,
//! exclusive and auto-delete queues as well as manual acknowledgement with a prefetch window.
//! When a consumer stream is dropped, all of its unsettled deliveries are put back into their
//! queue and flagged as redelivered, which mirrors what a real broker does when a consumer dies.
//!
//! It is used as the test double throughout the crate and powers the self-contained `demo`.

mod consumer;
mod state;

use super::super::broker::{
    AckMode, Broker, DeliveryStream, DeliveryTag, ExchangeKind, Message, QueueHandle,
    QueueOptions, DEFAULT_EXCHANGE,
};
use super::super::BrokerError;
use async_trait::async_trait;
use state::{Exchange, QueueState, State};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};
use uuid::Uuid;

const GENERATED_QUEUE_PREFIX: &str = "amq.gen-";

struct Inner {
    state: Mutex<State>,
    next_tag: AtomicU64,
    next_consumer: AtomicU64,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        // The state is consistent after every individual mutation, so a poisoned lock is still usable
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Broker living entirely within the current process
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Creates an empty broker with only the default exchange
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                next_tag: AtomicU64::new(1),
                next_consumer: AtomicU64::new(1),
            }),
        }
    }

    /// Number of messages waiting in a queue, `None` if the queue does not exist
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.inner.state().queues.get(queue).map(|q| q.ready.len())
    }

    /// Number of deliveries that have been handed out but not yet settled
    pub fn unsettled(&self) -> usize {
        self.inner.state().unacked.len()
    }

    /// Whether a queue with the given name currently exists
    pub fn has_queue(&self, queue: &str) -> bool {
        self.inner.state().queues.contains_key(queue)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<QueueHandle, BrokerError> {
        let name = if name.is_empty() {
            format!("{}{}", GENERATED_QUEUE_PREFIX, Uuid::new_v4().simple())
        } else {
            name.to_owned()
        };

        let mut state = self.inner.state();
        if let Some(existing) = state.queues.get(&name) {
            if existing.options != options {
                return Err(BrokerError::Protocol(format!(
                    "queue '{}' redeclared with different options",
                    name
                )));
            }
        } else {
            debug!(queue = %name, ?options, "Declaring queue");
            state.queues.insert(name.clone(), QueueState::new(options));
        }

        Ok(QueueHandle::new(name))
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError> {
        if name == DEFAULT_EXCHANGE {
            return Err(BrokerError::Protocol(
                "the default exchange can not be redeclared".into(),
            ));
        }

        let mut state = self.inner.state();
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind || existing.durable != durable => {
                Err(BrokerError::Protocol(format!(
                    "exchange '{}' redeclared as {} but it is {}",
                    name, kind, existing.kind
                )))
            }
            Some(_) => Ok(()),
            None => {
                debug!(exchange = %name, %kind, "Declaring exchange");
                state.exchanges.insert(
                    name.to_owned(),
                    Exchange {
                        kind,
                        durable,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.inner.state();

        if !state.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_owned()));
        }

        let target = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_owned()))?;

        let binding = (queue.to_owned(), routing_key.to_owned());
        if !target.bindings.contains(&binding) {
            debug!(%queue, %exchange, %routing_key, "Binding queue");
            target.bindings.push(binding);
        }

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<(), BrokerError> {
        let mut state = self.inner.state();

        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            vec![routing_key.to_owned()]
        } else {
            let exchange = state
                .exchanges
                .get(exchange)
                .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_owned()))?;

            exchange
                .bindings
                .iter()
                .filter(|(_, key)| exchange.kind.routes(key, routing_key))
                .map(|(queue, _)| queue.clone())
                .collect()
        };

        let mut routed = 0;
        for target in targets {
            if let Some(queue) = state.queues.get_mut(&target) {
                queue.push_back(message.clone());
                routed += 1;
            }
        }

        if routed == 0 {
            trace!(%exchange, %routing_key, "Dropping unroutable message");
        }

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        ack_mode: AckMode,
        prefetch: u16,
    ) -> Result<DeliveryStream, BrokerError> {
        let notify = {
            let mut state = self.inner.state();
            let target = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::UnknownQueue(queue.to_owned()))?;

            if target.options.exclusive && target.consumers > 0 {
                return Err(BrokerError::QueueLocked(queue.to_owned()));
            }

            target.consumers += 1;
            target.notify.clone()
        };

        debug!(%queue, ?ack_mode, prefetch, "Starting consumer");

        Ok(consumer::delivery_stream(
            self.inner.clone(),
            queue.to_owned(),
            notify,
            ack_mode,
            prefetch,
        ))
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.inner
            .state()
            .unacked
            .remove(&tag)
            .map(|_| ())
            .ok_or(BrokerError::UnknownDelivery(tag))
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.inner.state();
        let unacked = state
            .unacked
            .remove(&tag)
            .ok_or(BrokerError::UnknownDelivery(tag))?;

        if requeue {
            if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                queue.requeue(unacked.message);
            }
        } else {
            debug!(%tag, queue = %unacked.queue, "Discarding rejected delivery");
        }

        Ok(())
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::time::timeout;

    const PATIENCE: Duration = Duration::from_millis(100);

    async fn broker_with_queue(name: &str) -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker
            .declare_queue(name, QueueOptions::default())
            .await
            .unwrap();
        broker
    }

    #[tokio::test]
    async fn route_through_default_exchange() {
        let broker = broker_with_queue("work").await;
        let message = Message::new("hello").with_correlation_id("abc");

        broker.publish("", "work", message.clone()).await.unwrap();
        broker.publish("", "nowhere", Message::new("lost")).await.unwrap();

        let mut stream = broker.consume("work", AckMode::Auto, 0).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();

        assert_eq!(delivery.message, message);
        assert_eq!(delivery.queue, "work");
        assert!(!delivery.redelivered);
        assert_eq!(broker.unsettled(), 0);
    }

    #[tokio::test]
    async fn generate_queue_names() {
        let broker = MemoryBroker::new();
        let first = broker.declare_queue("", QueueOptions::private()).await.unwrap();
        let second = broker.declare_queue("", QueueOptions::private()).await.unwrap();

        assert!(first.name().starts_with(GENERATED_QUEUE_PREFIX));
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn enforce_prefetch_window() {
        let broker = broker_with_queue("work").await;
        for body in ["1", "2"] {
            broker.publish("", "work", Message::new(body)).await.unwrap();
        }

        let mut stream = broker.consume("work", AckMode::Manual, 1).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();

        // The second message is held back until the first one is settled
        assert!(timeout(PATIENCE, stream.next()).await.is_err());

        broker.ack(first.tag).await.unwrap();
        let second = timeout(PATIENCE, stream.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(second.message.body(), b"2");
    }

    #[tokio::test]
    async fn redeliver_nacked_messages() {
        let broker = broker_with_queue("work").await;
        broker.publish("", "work", Message::new("1")).await.unwrap();

        let mut stream = broker.consume("work", AckMode::Manual, 1).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        broker.nack(first.tag, true).await.unwrap();

        let again = stream.next().await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_eq!(again.message, first.message);
        assert_ne!(again.tag, first.tag);

        broker.nack(again.tag, false).await.unwrap();
        assert_eq!(broker.queue_depth("work"), Some(0));
        assert!(matches!(
            broker.ack(again.tag).await,
            Err(BrokerError::UnknownDelivery(_))
        ));
    }

    #[tokio::test]
    async fn recover_deliveries_of_dropped_consumer() {
        let broker = broker_with_queue("work").await;
        broker.publish("", "work", Message::new("1")).await.unwrap();

        let mut stream = broker.consume("work", AckMode::Manual, 1).await.unwrap();
        stream.next().await.unwrap().unwrap();
        drop(stream);

        assert_eq!(broker.unsettled(), 0);
        assert_eq!(broker.queue_depth("work"), Some(1));

        let mut stream = broker.consume("work", AckMode::Manual, 1).await.unwrap();
        assert!(stream.next().await.unwrap().unwrap().redelivered);
    }

    #[tokio::test]
    async fn fan_out_to_every_bound_queue() {
        let broker = MemoryBroker::new();
        broker
            .declare_exchange("logs", ExchangeKind::Fanout, true)
            .await
            .unwrap();

        let first = broker.declare_queue("", QueueOptions::private()).await.unwrap();
        let second = broker.declare_queue("", QueueOptions::private()).await.unwrap();
        broker.bind(first.name(), "logs", "").await.unwrap();
        broker.bind(second.name(), "logs", "").await.unwrap();

        broker
            .publish("logs", "ignored", Message::new("line"))
            .await
            .unwrap();

        assert_eq!(broker.queue_depth(first.name()), Some(1));
        assert_eq!(broker.queue_depth(second.name()), Some(1));
    }

    #[tokio::test]
    async fn route_direct_exchange_by_key() {
        let broker = broker_with_queue("errors").await;
        broker
            .declare_exchange("severity", ExchangeKind::Direct, false)
            .await
            .unwrap();
        broker.bind("errors", "severity", "error").await.unwrap();

        broker.publish("severity", "info", Message::new("a")).await.unwrap();
        broker.publish("severity", "error", Message::new("b")).await.unwrap();

        assert_eq!(broker.queue_depth("errors"), Some(1));
    }

    #[tokio::test]
    async fn reject_unknown_topology() {
        let broker = MemoryBroker::new();

        assert!(matches!(
            broker.publish("missing", "", Message::new("x")).await,
            Err(BrokerError::UnknownExchange(_))
        ));
        assert!(matches!(
            broker.consume("missing", AckMode::Auto, 0).await,
            Err(BrokerError::UnknownQueue(_))
        ));
        assert!(matches!(
            broker.bind("missing", "logs", "").await,
            Err(BrokerError::UnknownQueue(_))
        ));
    }

    #[tokio::test]
    async fn reject_conflicting_exchange() {
        let broker = MemoryBroker::new();
        broker
            .declare_exchange("logs", ExchangeKind::Fanout, true)
            .await
            .unwrap();

        assert!(broker
            .declare_exchange("logs", ExchangeKind::Fanout, true)
            .await
            .is_ok());
        assert!(matches!(
            broker.declare_exchange("logs", ExchangeKind::Direct, true).await,
            Err(BrokerError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn lock_and_delete_private_queues() {
        let broker = MemoryBroker::new();
        let queue = broker.declare_queue("", QueueOptions::private()).await.unwrap();

        let stream = broker.consume(queue.name(), AckMode::Auto, 0).await.unwrap();
        assert!(matches!(
            broker.consume(queue.name(), AckMode::Auto, 0).await,
            Err(BrokerError::QueueLocked(_))
        ));

        drop(stream);
        assert!(!broker.has_queue(queue.name()));
    }
}
