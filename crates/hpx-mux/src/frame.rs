//! Application frames carried over every socket.
//!
//! On the wire a frame is a JSON text envelope
//! `{ "type": string, "payload": any, "timestamp"?: number, "id"?: string }`.
//! In memory the `type` selects a [`FrameBody`] variant; types this crate
//! does not know, and known types whose payload does not have the expected
//! shape, are kept as [`FrameBody::Opaque`].

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{TransportError, TransportResult};

/// Payload of an `auth` frame.
///
/// Outbound frames carry the bearer `token`; servers answer with
/// `authenticated`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthPayload {
    /// Bearer credential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Server verdict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authenticated: Option<bool>,
}

/// Payload of `subscribe` / `unsubscribe` frames.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelPayload {
    /// Channel name, when the feed multiplexes channels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Feed-specific filters.
    #[serde(flatten)]
    pub filters: Map<String, Value>,
}

/// Payload of an `error` frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human readable message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Anything else the server sent.
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

/// Frame contents, keyed by the envelope `type`.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum FrameBody {
    /// `auth`
    Auth(AuthPayload),
    /// `subscribe`
    Subscribe(ChannelPayload),
    /// `unsubscribe`
    Unsubscribe(ChannelPayload),
    /// `ping`
    Ping,
    /// `pong`
    Pong,
    /// `error`
    Error(ErrorPayload),
    /// Any other type; interpreted only by routers.
    Opaque {
        /// Envelope `type`.
        kind: String,
        /// Raw payload.
        payload: Value,
    },
}

impl FrameBody {
    /// The envelope `type` for this body.
    pub fn kind(&self) -> &str {
        match self {
            Self::Auth(_) => "auth",
            Self::Subscribe(_) => "subscribe",
            Self::Unsubscribe(_) => "unsubscribe",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Error(_) => "error",
            Self::Opaque { kind, .. } => kind,
        }
    }

    fn from_parts(kind: String, payload: Value) -> Self {
        fn shaped<T: DeserializeOwned>(payload: &Value) -> Option<T> {
            let value = if payload.is_null() {
                Value::Object(Map::new())
            } else {
                payload.clone()
            };
            serde_json::from_value(value).ok()
        }

        let body = match kind.as_str() {
            "auth" => shaped(&payload).map(Self::Auth),
            "subscribe" => shaped(&payload).map(Self::Subscribe),
            "unsubscribe" => shaped(&payload).map(Self::Unsubscribe),
            "ping" => Some(Self::Ping),
            "pong" => Some(Self::Pong),
            "error" => shaped(&payload).map(Self::Error),
            _ => None,
        };

        body.unwrap_or_else(|| {
            if matches!(kind.as_str(), "auth" | "subscribe" | "unsubscribe" | "error") {
                debug!(kind = %kind, "Payload does not match known shape; keeping opaque");
            }
            Self::Opaque { kind, payload }
        })
    }

    fn payload_value(&self) -> TransportResult<Value> {
        let value = match self {
            Self::Auth(p) => serde_json::to_value(p)?,
            Self::Subscribe(p) | Self::Unsubscribe(p) => {
                if p.channel.is_none() && p.filters.is_empty() {
                    Value::Null
                } else {
                    serde_json::to_value(p)?
                }
            }
            Self::Error(p) => serde_json::to_value(p)?,
            Self::Ping | Self::Pong => Value::Null,
            Self::Opaque { payload, .. } => payload.clone(),
        };
        Ok(value)
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
}

/// A decoded application frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// Typed contents.
    pub body: FrameBody,
    /// Sender timestamp, milliseconds since the epoch.
    pub timestamp: Option<i64>,
    /// Optional correlation id.
    pub id: Option<String>,
}

impl Frame {
    /// Frame with the given body and no metadata.
    pub fn new(body: FrameBody) -> Self {
        Self {
            body,
            timestamp: None,
            id: None,
        }
    }

    /// Frame of arbitrary type.
    pub fn opaque(kind: impl Into<String>, payload: Value) -> Self {
        Self::new(FrameBody::from_parts(kind.into(), payload))
    }

    /// `{type:"auth", payload:{token}}`
    pub fn auth(token: impl Into<String>) -> Self {
        Self::new(FrameBody::Auth(AuthPayload {
            token: Some(token.into()),
            authenticated: None,
        }))
    }

    /// `{type:"subscribe", payload:{channel}}`, or a bare `{type:"subscribe"}`
    /// without a channel.
    pub fn subscribe(channel: Option<String>) -> Self {
        Self::new(FrameBody::Subscribe(ChannelPayload {
            channel,
            filters: Map::new(),
        }))
    }

    /// `{type:"unsubscribe", payload:{channel}}`
    pub fn unsubscribe(channel: Option<String>) -> Self {
        Self::new(FrameBody::Unsubscribe(ChannelPayload {
            channel,
            filters: Map::new(),
        }))
    }

    /// `{type:"ping"}`
    pub fn ping() -> Self {
        Self::new(FrameBody::Ping)
    }

    /// Attach a correlation id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Attach a timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// The envelope `type`.
    pub fn kind(&self) -> &str {
        self.body.kind()
    }

    /// The payload as raw JSON (`null` when absent).
    pub fn payload(&self) -> Value {
        self.body.payload_value().unwrap_or(Value::Null)
    }

    /// Decode from a JSON value that is already structured.
    pub fn from_value(value: Value) -> TransportResult<Self> {
        let envelope: Envelope = serde_json::from_value(value)
            .map_err(|e| TransportError::frame_parse(e.to_string()))?;
        Ok(Self::from_envelope(envelope))
    }

    /// Decode from envelope text.
    pub fn parse(text: &str) -> TransportResult<Self> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| TransportError::frame_parse(e.to_string()))?;
        Ok(Self::from_envelope(envelope))
    }

    fn from_envelope(envelope: Envelope) -> Self {
        Self {
            body: FrameBody::from_parts(envelope.kind, envelope.payload),
            timestamp: envelope.timestamp,
            id: envelope.id,
        }
    }

    fn to_envelope(&self) -> TransportResult<Envelope> {
        Ok(Envelope {
            kind: self.kind().to_string(),
            payload: self.body.payload_value()?,
            timestamp: self.timestamp,
            id: self.id.clone(),
        })
    }

    /// The envelope as a JSON value.
    pub fn to_value(&self) -> TransportResult<Value> {
        Ok(serde_json::to_value(self.to_envelope()?)?)
    }

    /// Serialize to envelope text.
    pub fn to_text(&self) -> TransportResult<String> {
        Ok(serde_json::to_string(&self.to_envelope()?)?)
    }
}

/// Raw inbound data as delivered by a socket.
#[derive(Clone, Debug)]
pub enum Inbound {
    /// Text frame requiring deserialization.
    Text(String),
    /// Binary frame; decoded as UTF-8 JSON.
    Binary(Vec<u8>),
    /// Already structured payload.
    Structured(Value),
}

impl Inbound {
    /// Decode into a [`Frame`].
    pub fn decode(self) -> TransportResult<Frame> {
        match self {
            Self::Text(text) => Frame::parse(&text),
            Self::Binary(data) => {
                let text = String::from_utf8(data)
                    .map_err(|e| TransportError::frame_parse(e.to_string()))?;
                Frame::parse(&text)
            }
            Self::Structured(value) => Frame::from_value(value),
        }
    }
}

/// Something the caller wants written to a socket.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    /// A typed frame, serialized as an envelope.
    Frame(Frame),
    /// Arbitrary JSON, serialized as-is.
    Json(Value),
    /// Pre-serialized text, written verbatim.
    Text(String),
}

impl Outbound {
    /// Serialize for the wire.
    pub fn to_text(&self) -> TransportResult<String> {
        match self {
            Self::Frame(frame) => frame.to_text(),
            Self::Json(value) => Ok(serde_json::to_string(value)?),
            Self::Text(text) => Ok(text.clone()),
        }
    }
}

impl From<Frame> for Outbound {
    fn from(frame: Frame) -> Self {
        Self::Frame(frame)
    }
}

impl From<Value> for Outbound {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<String> for Outbound {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Outbound {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_auth_frame_wire_shape() {
        let text = Frame::auth("secret").to_text().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"type": "auth", "payload": {"token": "secret"}}));
    }

    #[test]
    fn test_ping_has_no_payload() {
        assert_eq!(Frame::ping().to_text().unwrap(), r#"{"type":"ping"}"#);
    }

    #[test]
    fn test_inbound_auth_reply_is_typed() {
        let frame = Frame::parse(r#"{"type":"auth","payload":{"authenticated":true}}"#).unwrap();
        assert_eq!(
            frame.body,
            FrameBody::Auth(AuthPayload {
                token: None,
                authenticated: Some(true),
            })
        );
    }

    #[test]
    fn test_unknown_type_is_opaque() {
        let frame =
            Frame::parse(r#"{"type":"data","payload":{"cpu":{"usage":12.5}},"timestamp":7}"#)
                .unwrap();
        assert_eq!(frame.kind(), "data");
        assert_eq!(frame.timestamp, Some(7));
        assert_eq!(frame.payload(), json!({"cpu": {"usage": 12.5}}));
    }

    #[test]
    fn test_known_type_with_foreign_shape_falls_back() {
        let frame = Frame::parse(r#"{"type":"error","payload":"denied"}"#).unwrap();
        assert!(matches!(frame.body, FrameBody::Opaque { .. }));
        assert_eq!(frame.kind(), "error");
        assert_eq!(frame.payload(), json!("denied"));
    }

    #[test]
    fn test_subscribe_keeps_filters() {
        let frame = Frame::parse(
            r#"{"type":"subscribe","payload":{"channel":"vm-events","severity":"warn"}}"#,
        )
        .unwrap();
        let FrameBody::Subscribe(payload) = &frame.body else {
            panic!("expected subscribe body");
        };
        assert_eq!(payload.channel.as_deref(), Some("vm-events"));
        assert_eq!(payload.filters.get("severity"), Some(&json!("warn")));
    }

    #[test]
    fn test_subscribe_without_channel_has_no_payload() {
        assert_eq!(
            Frame::subscribe(None).to_text().unwrap(),
            r#"{"type":"subscribe"}"#
        );
        let parsed = Frame::parse(r#"{"type":"subscribe"}"#).unwrap();
        assert_eq!(parsed, Frame::subscribe(None));
    }

    #[test]
    fn test_structured_and_binary_inbound() {
        let structured = Inbound::Structured(json!({"type": "event", "payload": 1}));
        assert_eq!(structured.decode().unwrap().kind(), "event");

        let binary = Inbound::Binary(br#"{"type":"pong"}"#.to_vec());
        assert_eq!(binary.decode().unwrap().body, FrameBody::Pong);
    }

    #[test]
    fn test_malformed_inbound_is_parse_error() {
        let err = Inbound::Text("not json".into()).decode().unwrap_err();
        assert!(matches!(err, TransportError::FrameParse { .. }));

        let err = Inbound::Text(r#"{"payload":1}"#.into()).decode().unwrap_err();
        assert!(matches!(err, TransportError::FrameParse { .. }));
    }

    #[test]
    fn test_outbound_text_is_verbatim() {
        assert_eq!(Outbound::from("raw").to_text().unwrap(), "raw");
        assert_eq!(
            Outbound::from(json!({"type": "input", "payload": "ls\n"}))
                .to_text()
                .unwrap(),
            r#"{"payload":"ls\n","type":"input"}"#
        );
    }
}
