use super::super::super::broker::{Delivery, DeliveryTag, Message};
use super::super::super::BrokerError;
use redis::streams::StreamId;
use serde::{Deserialize, Serialize};

const FIELD_BODY: &str = "body";
const FIELD_CORRELATION_ID: &str = "correlation_id";
const FIELD_REPLY_TO: &str = "reply_to";
const FIELD_CONTENT_TYPE: &str = "content_type";
const FIELD_REDELIVERED: &str = "redelivered";

/// Queue bound to an exchange, stored as JSON in the binding set of the exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(super) struct Binding {
    pub queue: String,
    pub key: String,
}

/// Translates a message into the field list of a stream entry
///
/// Metadata is stored in dedicated fields next to the body. Absent metadata is omitted.
pub(super) fn encode(message: &Message, redelivered: bool) -> Vec<(&'static str, Vec<u8>)> {
    let mut fields = vec![(FIELD_BODY, message.body().to_vec())];

    if let Some(correlation_id) = message.correlation_id() {
        fields.push((FIELD_CORRELATION_ID, correlation_id.as_bytes().to_vec()));
    }

    if let Some(reply_to) = message.reply_to() {
        fields.push((FIELD_REPLY_TO, reply_to.as_bytes().to_vec()));
    }

    if let Some(content_type) = message.content_type() {
        fields.push((FIELD_CONTENT_TYPE, content_type.as_bytes().to_vec()));
    }

    if redelivered {
        fields.push((FIELD_REDELIVERED, b"1".to_vec()));
    }

    fields
}

/// Rebuilds a message from a stream entry, returning it together with its redelivery flag
pub(super) fn decode(entry: &StreamId) -> Result<(Message, bool), BrokerError> {
    let body: Vec<u8> = entry.get(FIELD_BODY).ok_or_else(|| {
        BrokerError::Protocol(format!("stream entry {} has no body field", entry.id))
    })?;

    let mut message = Message::new(body);

    if let Some(correlation_id) = entry.get::<String>(FIELD_CORRELATION_ID) {
        message = message.with_correlation_id(correlation_id);
    }

    if let Some(reply_to) = entry.get::<String>(FIELD_REPLY_TO) {
        message = message.with_reply_to(reply_to);
    }

    if let Some(content_type) = entry.get::<String>(FIELD_CONTENT_TYPE) {
        message = message.with_content_type(content_type);
    }

    let redelivered = entry.map.contains_key(FIELD_REDELIVERED);

    Ok((message, redelivered))
}

/// Assembles a [`Delivery`] from a stream entry
pub(super) fn delivery(
    tag: DeliveryTag,
    queue: &str,
    entry: &StreamId,
    from_pending: bool,
) -> Result<(Delivery, Message), BrokerError> {
    let (message, redelivered) = decode(entry)?;

    let delivery = Delivery {
        tag,
        queue: queue.to_owned(),
        redelivered: redelivered || from_pending,
        message: message.clone(),
    };

    Ok((delivery, message))
}
