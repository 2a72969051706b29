use super::super::broker::{Message, TEXT_PLAIN};
use super::CorrelationId;
use std::borrow::Cow;
use thiserror::Error;

/// Message metadata required to answer a request is missing
#[derive(Error, Debug, PartialEq, Eq)]
pub enum MissingMetadata {
    /// No correlation identifier attached
    #[error("message carries no correlation id")]
    CorrelationId,
    /// No reply address attached
    #[error("message carries no reply address")]
    ReplyTo,
}

/// Unit of work sent by a [`Requestor`](super::Requestor)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    body: Vec<u8>,
    correlation_id: CorrelationId,
    reply_to: String,
}

impl Request {
    /// Creates a new instance from raw parts
    pub fn new(
        body: impl Into<Vec<u8>>,
        correlation_id: CorrelationId,
        reply_to: impl Into<String>,
    ) -> Self {
        Self {
            body: body.into(),
            correlation_id,
            reply_to: reply_to.into(),
        }
    }

    /// Opaque payload
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Identifier the reply has to carry
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Queue the reply has to be sent to
    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::new(request.body)
            .with_correlation_id(request.correlation_id.as_str())
            .with_reply_to(request.reply_to)
    }
}

impl TryFrom<Message> for Request {
    type Error = MissingMetadata;

    fn try_from(message: Message) -> Result<Self, Self::Error> {
        let correlation_id = message
            .correlation_id()
            .map(CorrelationId::from)
            .ok_or(MissingMetadata::CorrelationId)?;

        let reply_to = message
            .reply_to()
            .map(str::to_owned)
            .ok_or(MissingMetadata::ReplyTo)?;

        Ok(Self {
            body: message.into_body(),
            correlation_id,
            reply_to,
        })
    }
}

/// Answer to a [`Request`], carrying its correlation identifier verbatim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    body: Vec<u8>,
    correlation_id: CorrelationId,
}

impl Reply {
    /// Creates a new instance from raw parts
    pub fn new(correlation_id: CorrelationId, body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            correlation_id,
        }
    }

    /// Opaque payload
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Payload interpreted as UTF-8 text, replacing invalid sequences
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Consumes the reply, returning the payload
    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// Identifier of the request this reply answers
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }
}

impl From<Reply> for Message {
    fn from(reply: Reply) -> Self {
        Message::new(reply.body)
            .with_correlation_id(reply.correlation_id.as_str())
            .with_content_type(TEXT_PLAIN)
    }
}

impl TryFrom<Message> for Reply {
    type Error = MissingMetadata;

    fn try_from(message: Message) -> Result<Self, Self::Error> {
        let correlation_id = message
            .correlation_id()
            .map(CorrelationId::from)
            .ok_or(MissingMetadata::CorrelationId)?;

        Ok(Self {
            body: message.into_body(),
            correlation_id,
        })
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn carry_metadata_next_to_the_body() {
        let request = Request::new("10", CorrelationId::from("abc"), "amq.gen-reply");
        let message = Message::from(request);

        assert_eq!(message.body(), b"10");
        assert_eq!(message.correlation_id(), Some("abc"));
        assert_eq!(message.reply_to(), Some("amq.gen-reply"));
    }

    #[test]
    fn reject_requests_without_reply_address() {
        let message = Message::new("10").with_correlation_id("abc");

        assert_eq!(Request::try_from(message), Err(MissingMetadata::ReplyTo));
    }

    #[test]
    fn reject_requests_without_correlation_id() {
        let message = Message::new("10").with_reply_to("amq.gen-reply");

        assert_eq!(Request::try_from(message), Err(MissingMetadata::CorrelationId));
    }

    #[test]
    fn mark_replies_as_text() {
        let message = Message::from(Reply::new(CorrelationId::from("abc"), "34"));

        assert_eq!(message.content_type(), Some(TEXT_PLAIN));
        assert_eq!(message.reply_to(), None);

        let reply = Reply::try_from(message).unwrap();
        assert_eq!(reply.text(), "34");
        assert_eq!(reply.correlation_id().as_str(), "abc");
    }
}
