//! Broker wrapper injecting failures into an in-memory broker

use super::super::broker::{
    AckMode, Broker, DeliveryStream, DeliveryTag, ExchangeKind, Message, QueueHandle, QueueOptions,
};
use super::super::implementation::memory::MemoryBroker;
use super::super::BrokerError;
use async_trait::async_trait;
use futures::{stream, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
pub struct Faulty {
    pub inner: MemoryBroker,
    refused_publishes: AtomicUsize,
    broken_consumers: bool,
}

impl Faulty {
    /// Fails the next `count` publish operations
    pub fn refusing_publishes(self, count: usize) -> Self {
        self.refused_publishes.store(count, Ordering::SeqCst);
        self
    }

    /// Hands out consumer streams which yield a single error and end
    pub fn with_broken_consumers(mut self) -> Self {
        self.broken_consumers = true;
        self
    }
}

#[async_trait]
impl Broker for Faulty {
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<QueueHandle, BrokerError> {
        self.inner.declare_queue(name, options).await
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError> {
        self.inner.declare_exchange(name, kind, durable).await
    }

    async fn bind(&self, queue: &str, exchange: &str, key: &str) -> Result<(), BrokerError> {
        self.inner.bind(queue, exchange, key).await
    }

    async fn publish(
        &self,
        exchange: &str,
        key: &str,
        message: Message,
    ) -> Result<(), BrokerError> {
        let refused = self
            .refused_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        if refused {
            return Err(BrokerError::Publish {
                exchange: exchange.to_owned(),
                source: "connection reset".into(),
            });
        }

        self.inner.publish(exchange, key, message).await
    }

    async fn consume(
        &self,
        queue: &str,
        ack_mode: AckMode,
        prefetch: u16,
    ) -> Result<DeliveryStream, BrokerError> {
        if self.broken_consumers {
            return Ok(stream::iter(vec![Err(BrokerError::Closed)]).boxed());
        }

        self.inner.consume(queue, ack_mode, prefetch).await
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.inner.ack(tag).await
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        self.inner.nack(tag, requeue).await
    }
}
