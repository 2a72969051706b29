use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the default exchange which routes directly to the queue named by the routing key
pub const DEFAULT_EXCHANGE: &str = "";

/// Flags used when declaring a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Queue survives a broker restart
    pub durable: bool,
    /// Queue may only be consumed by the declaring party
    pub exclusive: bool,
    /// Queue is removed once its last consumer goes away
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Options for a short-lived queue owned by a single consumer, e.g. a reply queue
    pub fn private() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// Reference to a declared queue
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueHandle {
    name: String,
}

impl QueueHandle {
    /// Creates a new instance from raw parts
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Name of the queue, generated by the broker if none was requested
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Routing behaviour of an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Routes to every queue bound with a routing key equal to the message's
    Direct,
    /// Routes to every bound queue, ignoring routing keys
    Fanout,
}

impl ExchangeKind {
    /// Whether a binding with `binding_key` receives a message published with `routing_key`
    pub fn routes(&self, binding_key: &str, routing_key: &str) -> bool {
        match self {
            ExchangeKind::Direct => binding_key == routing_key,
            ExchangeKind::Fanout => true,
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Direct => write!(f, "direct"),
            ExchangeKind::Fanout => write!(f, "fanout"),
        }
    }
}

/// How deliveries of a consumer are settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Every delivery has to be acknowledged explicitly and counts towards the prefetch limit
    Manual,
    /// Deliveries count as acknowledged the moment they are handed out
    Auto,
}

#[cfg(test)]
mod does {
    use super::*;

    #[test]
    fn route_by_kind() {
        assert!(ExchangeKind::Direct.routes("rpc", "rpc"));
        assert!(!ExchangeKind::Direct.routes("rpc", "logs"));
        assert!(ExchangeKind::Fanout.routes("", "anything"));
    }

    #[test]
    fn display_kind() {
        assert_eq!(ExchangeKind::Direct.to_string(), "direct");
        assert_eq!(ExchangeKind::Fanout.to_string(), "fanout");
    }
}
