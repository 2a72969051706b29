//! Capability set of a message broker
//!
//! The request/reply protocol only relies on a handful of primitives: declaring queues and
//! exchanges, binding them together, publishing messages and consuming them with explicit
//! acknowledgement. Everything else (persistence, routing internals, clustering) is left to
//! the broker behind the [`Broker`] trait.
//!
//! A consumer stream handed out by [`Broker::consume`] never ends on its own while the broker
//! is reachable. It can only be restarted by calling `consume` again. With [`AckMode::Manual`]
//! the broker hands out at most `prefetch` unsettled deliveries to a consumer, which is what
//! provides backpressure and fair distribution between multiple consumers of the same queue.

mod message;
mod topology;

pub use message::*;
pub use topology::*;

use super::BrokerError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

/// Infinite stream of deliveries from a queue
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Narrow interface to a message broker
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declares a queue, creating it if it does not exist yet
    ///
    /// Passing an empty name lets the broker generate a unique one which is returned in the handle.
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<QueueHandle, BrokerError>;

    /// Declares an exchange, creating it if it does not exist yet
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError>;

    /// Routes messages published to `exchange` with a matching `routing_key` into `queue`
    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str)
        -> Result<(), BrokerError>;

    /// Publishes a message to an exchange
    ///
    /// Messages routed to no queue are silently dropped, just like an AMQP broker does
    /// for non-mandatory publishes.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<(), BrokerError>;

    /// Starts consuming a queue
    async fn consume(
        &self,
        queue: &str,
        ack_mode: AckMode,
        prefetch: u16,
    ) -> Result<DeliveryStream, BrokerError>;

    /// Marks a delivery as processed
    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

    /// Rejects a delivery, optionally putting it back into its queue for redelivery
    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError>;
}

#[async_trait]
impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<QueueHandle, BrokerError> {
        (**self).declare_queue(name, options).await
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError> {
        (**self).declare_exchange(name, kind, durable).await
    }

    async fn bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        (**self).bind(queue, exchange, routing_key).await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<(), BrokerError> {
        (**self).publish(exchange, routing_key, message).await
    }

    async fn consume(
        &self,
        queue: &str,
        ack_mode: AckMode,
        prefetch: u16,
    ) -> Result<DeliveryStream, BrokerError> {
        (**self).consume(queue, ack_mode, prefetch).await
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        (**self).ack(tag).await
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        (**self).nack(tag, requeue).await
    }
}

/// Dynamic dispatch version of [`Broker`]
pub type SharedBroker = Arc<dyn Broker>;
