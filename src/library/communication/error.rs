use super::broker::DeliveryTag;
use crate::library::BoxedError;
use thiserror::Error;

/// Errors surfaced by [`Broker`](super::broker::Broker) implementations
///
/// Transport errors are always handed to the immediate caller. Whether a failure
/// is fatal is up to them: at startup a [`Connection`](BrokerError::Connection) error
/// usually is, during operation it may be retried.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The broker could not be reached or the connection broke down
    #[error("broker unreachable")]
    Connection(#[source] BoxedError),
    /// A message could not be handed to the broker
    #[error("publishing to exchange '{exchange}' failed")]
    Publish {
        /// Exchange the message was addressed to
        exchange: String,
        /// Underlying transport error
        #[source]
        source: BoxedError,
    },
    /// Referenced queue has not been declared
    #[error("queue '{0}' does not exist")]
    UnknownQueue(String),
    /// Referenced exchange has not been declared
    #[error("exchange '{0}' does not exist")]
    UnknownExchange(String),
    /// Delivery has already been settled or never existed
    #[error("delivery {0} is unknown or already settled")]
    UnknownDelivery(DeliveryTag),
    /// Exclusive queue is already consumed by someone else
    #[error("queue '{0}' is exclusively consumed by another consumer")]
    QueueLocked(String),
    /// The broker handed out data that does not follow the expected format
    #[error("unexpected data from broker: {0}")]
    Protocol(String),
    /// Broker handle has been shut down
    #[error("broker connection closed")]
    Closed,
}

impl BrokerError {
    /// Whether retrying the operation later might succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection(_) | BrokerError::Publish { .. } | BrokerError::Closed
        )
    }
}

impl From<redis::RedisError> for BrokerError {
    fn from(error: redis::RedisError) -> Self {
        if error.is_io_error() || error.is_connection_dropped() || error.is_connection_refusal() {
            BrokerError::Connection(Box::new(error))
        } else {
            BrokerError::Protocol(error.to_string())
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;

    #[test]
    fn classify_transient_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");

        assert!(BrokerError::Connection(Box::new(io)).is_transient());
        assert!(BrokerError::Closed.is_transient());
        assert!(!BrokerError::UnknownQueue("rpc_queue".into()).is_transient());
        assert!(!BrokerError::UnknownDelivery(DeliveryTag::new(4)).is_transient());
    }

    #[test]
    fn format_with_context() {
        let error = BrokerError::UnknownDelivery(DeliveryTag::new(7));
        assert_eq!(error.to_string(), "delivery 7 is unknown or already settled");
    }
}
