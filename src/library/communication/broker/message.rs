use std::fmt;

/// Content type attached to replies produced by the worker loop
pub const TEXT_PLAIN: &str = "text/plain";

/// Unit of transfer handed to and received from a broker
///
/// The body is opaque to the broker. Correlation identifier and reply address travel as
/// metadata next to the body and are never embedded into it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    body: Vec<u8>,
    correlation_id: Option<String>,
    reply_to: Option<String>,
    content_type: Option<String>,
}

impl Message {
    /// Creates a message without any metadata
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    /// Attaches a correlation identifier
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Attaches the name of the queue replies should be sent to
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Attaches a MIME content type describing the body
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Opaque payload
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Consumes the message, returning the payload
    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// Correlation identifier, if any
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Reply address, if any
    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    /// Content type, if any
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }
}

/// Broker assigned identifier of a delivery, used to settle it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    /// Wraps a raw tag value
    pub fn new(tag: u64) -> Self {
        Self(tag)
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message handed out by a consumer stream
///
/// With [`AckMode::Manual`](super::AckMode::Manual) every delivery must be settled using
/// [`Broker::ack`](super::Broker::ack) or [`Broker::nack`](super::Broker::nack) with its tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Tag to settle the delivery with
    pub tag: DeliveryTag,
    /// Queue the delivery has been taken from
    pub queue: String,
    /// Whether the message has been handed out before without being acknowledged
    pub redelivered: bool,
    /// Delivered message
    pub message: Message,
}
