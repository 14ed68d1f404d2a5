//! Wire protocol types for parent-child communication.
//!
//! Every frame carries one [`Envelope`]. Request/reply is layered on top by
//! shaping the envelope's `data`:
//! - request: `{ "data": ..., "replyEvent": "$$reply::..." }`
//! - reply:   `{ "data": ... }` or `{ "error": "message" }`

use serde::{Deserialize, Deserializer, Serialize, de};
use serde_json::Value;

/// Sent once by the child after it has installed its handlers.
pub const READY_EVENT: &str = "ready";

/// Cooperative shutdown request from parent to child.
pub const STOP_EVENT: &str = "stop";

/// Namespace for reply correlation identifiers.
pub const REPLY_PREFIX: &str = "$$reply::";

/// Local notification carrying every decoded envelope. Never sent on the wire.
pub const RAW_MESSAGE_TOPIC: &str = "$$message";

/// Local notification for frames that could not be decoded. Never sent on the wire.
pub const MALFORMED_TOPIC: &str = "$$malformed";

/// Local notification fired once when the peer's stream ends. Never sent on the wire.
pub const CLOSED_TOPIC: &str = "$$closed";

/// Topics that only exist on the local bus.
pub fn is_local_topic(event: &str) -> bool {
    matches!(event, RAW_MESSAGE_TOPIC | MALFORMED_TOPIC | CLOSED_TOPIC)
}

/// Build the reply event name for a request on `event`.
pub fn reply_event_name(event: &str, disambiguator: &str) -> String {
    format!("{REPLY_PREFIX}{event}::{disambiguator}")
}

pub fn is_reply_event(event: &str) -> bool {
    event.starts_with(REPLY_PREFIX)
}

/// The `{event, data}` unit exchanged over the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.event.is_empty()
    }
}

/// Payload of a request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_event: Option<String>,
}

impl RequestPayload {
    pub fn new(data: Value, reply_event: impl Into<String>) -> Self {
        Self {
            data,
            reply_event: Some(reply_event.into()),
        }
    }
}

/// Payload of a reply envelope. Exactly one of `error` / `data` is present.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ReplyPayload {
    Failure { error: String },
    Success { data: Value },
}

/// Wire shape before the exactly-one-field check. `Some(Value::Null)` means
/// the field was present with a null value.
#[derive(Deserialize)]
struct RawReply {
    #[serde(default, deserialize_with = "present")]
    data: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    error: Option<Value>,
}

fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl<'de> Deserialize<'de> for ReplyPayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawReply::deserialize(deserializer)?;
        let error = raw.error.filter(|e| !e.is_null());
        match (raw.data, error) {
            (Some(data), None) => Ok(Self::Success { data }),
            (None, Some(error)) => Ok(Self::Failure {
                error: error_message(error),
            }),
            (Some(_), Some(_)) => Err(de::Error::custom("reply has both data and error")),
            (None, None) => Err(de::Error::custom("reply has neither data nor error")),
        }
    }
}

/// A string error is the message itself; an object contributes its
/// `message`; anything else is reported as its JSON text.
fn error_message(error: Value) -> String {
    match error {
        Value::String(message) => message,
        Value::Object(ref fields) => match fields.get("message") {
            Some(Value::String(message)) => message.clone(),
            _ => error.to_string(),
        },
        other => other.to_string(),
    }
}

impl ReplyPayload {
    pub fn success(data: Value) -> Self {
        Self::Success { data }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
        }
    }

    pub fn into_result(self) -> Result<Value, String> {
        match self {
            Self::Success { data } => Ok(data),
            Self::Failure { error } => Err(error),
        }
    }
}
