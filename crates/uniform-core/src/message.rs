//! Wire messages exchanged between channels.
//!
//! Every message is a JSON object:
//!
//! ```text
//! { id, channel, sender, type: request|response|event|signal, reqId?, payload, timestamp }
//! ```
//!
//! `channel` names the destination and `sender` the origin. The payload shape
//! depends on `type`; typed views are available through [`RequestPayload`],
//! [`ResponsePayload`], [`EventPayload`] and [`SignalPayload`].

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec::{Descriptor, WireValue};
use crate::error::{ChannelError, Result};
use crate::reflect::Action;
use crate::transport::TransportKind;
use crate::value::Path;

/// Message category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
    Event,
    Signal,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Request => "request",
            MessageKind::Response => "response",
            MessageKind::Event => "event",
            MessageKind::Signal => "signal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "request" => Some(MessageKind::Request),
            "response" => Some(MessageKind::Response),
            "event" => Some(MessageKind::Event),
            "signal" => Some(MessageKind::Signal),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub channel: String,
    pub sender: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: i64,
}

impl Message {
    /// A new message with a fresh id and the current timestamp.
    pub fn new(
        kind: MessageKind,
        channel: impl Into<String>,
        sender: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel: channel.into(),
            sender: sender.into(),
            kind,
            req_id: None,
            transport: None,
            payload,
            timestamp: now_millis(),
        }
    }

    pub fn request(id: String, channel: &str, sender: &str, payload: &RequestPayload) -> Result<Self> {
        let mut message = Self::new(MessageKind::Request, channel, sender, serde_json::to_value(payload)?);
        message.id = id;
        Ok(message)
    }

    /// Response correlated to request `req_id`.
    pub fn response(req_id: &str, channel: &str, sender: &str, payload: &ResponsePayload) -> Result<Self> {
        let mut message = Self::new(MessageKind::Response, channel, sender, serde_json::to_value(payload)?);
        message.req_id = Some(req_id.to_string());
        Ok(message)
    }

    pub fn event(channel: &str, sender: &str, payload: &EventPayload) -> Result<Self> {
        Ok(Self::new(MessageKind::Event, channel, sender, serde_json::to_value(payload)?))
    }

    pub fn signal(channel: &str, sender: &str, payload: &SignalPayload) -> Result<Self> {
        Ok(Self::new(MessageKind::Signal, channel, sender, serde_json::to_value(payload)?))
    }

    /// Id a response answers: `reqId`, falling back to `id`.
    pub fn correlation_id(&self) -> &str {
        self.req_id.as_deref().unwrap_or(&self.id)
    }

    pub fn request_payload(&self) -> Result<RequestPayload> {
        self.typed_payload(MessageKind::Request)
    }

    pub fn response_payload(&self) -> Result<ResponsePayload> {
        self.typed_payload(MessageKind::Response)
    }

    pub fn event_payload(&self) -> Result<EventPayload> {
        self.typed_payload(MessageKind::Event)
    }

    pub fn signal_payload(&self) -> Result<SignalPayload> {
        self.typed_payload(MessageKind::Signal)
    }

    fn typed_payload<T: DeserializeOwned>(&self, expected: MessageKind) -> Result<T> {
        if self.kind != expected {
            return Err(ChannelError::InvalidMessage {
                message: format!("expected {} payload, got {}", expected, self.kind),
            });
        }
        serde_json::from_value(self.payload.clone()).map_err(|e| ChannelError::InvalidMessage {
            message: format!("malformed {} payload: {}", expected, e),
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| ChannelError::InvalidMessage {
            message: format!("undecodable message: {}", e),
        })
    }
}

/// `request` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    pub action: Action,
    #[serde(default)]
    pub path: Path,
    #[serde(default)]
    pub args: Vec<WireValue>,
}

/// `response` payload: either a result (inline or descriptor) or an error.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<WireValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<Descriptor>,
}

impl ResponsePayload {
    pub fn ok(result: WireValue) -> Self {
        Self {
            result: Some(result),
            ..Self::default()
        }
    }

    pub fn reference(descriptor: Descriptor) -> Self {
        Self {
            descriptor: Some(descriptor),
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

/// `event` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    #[serde(rename = "type")]
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Signal type strings.
pub mod signal {
    pub const CONNECT: &str = "connect";
    pub const NOTIFY: &str = "notify";
}

/// `signal` payload: connection handshakes and notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    #[serde(rename = "type")]
    pub signal: String,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serializes_with_type_tag() {
        let payload = RequestPayload {
            action: Action::Apply,
            path: vec!["greet".into()],
            args: vec![WireValue::List(vec![])],
        };
        let message = Message::request("r1".into(), "host", "worker", &payload).unwrap();
        let json = serde_json::to_value(&message).unwrap();

        assert_eq!(json["type"], "request");
        assert_eq!(json["id"], "r1");
        assert_eq!(json["payload"]["action"], "apply");
        assert!(json.get("reqId").is_none());

        let parsed = Message::from_bytes(&message.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.request_payload().unwrap(), payload);
    }

    #[test]
    fn test_response_correlates_by_req_id() {
        let message = Message::response("r1", "worker", "host", &ResponsePayload::ok(WireValue::Int(1))).unwrap();
        assert_ne!(message.id, "r1");
        assert_eq!(message.correlation_id(), "r1");
    }

    #[test]
    fn test_typed_payload_checks_kind() {
        let message = Message::event(
            "host",
            "worker",
            &EventPayload {
                event: "tick".into(),
                data: serde_json::json!(1),
            },
        )
        .unwrap();
        assert!(matches!(
            message.request_payload(),
            Err(ChannelError::InvalidMessage { .. })
        ));
        assert_eq!(message.event_payload().unwrap().event, "tick");
    }

    #[test]
    fn test_garbage_bytes_are_invalid_message() {
        assert!(matches!(
            Message::from_bytes(b"not json"),
            Err(ChannelError::InvalidMessage { .. })
        ));
    }
}
