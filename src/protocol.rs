// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire Protocol
//!
//! JSON envelopes exchanged with web clients over WebSocket text frames.
//!
//! Inbound: `{ "type": "auth" | "message" | "api_call" | "heartbeat", "echo"?, "payload" }`.
//! Outbound: `{ "type": ..., "echo"?, "payload" }`, except `error` which
//! carries a top-level `message` instead of a payload.
//!
//! `echo` is an opaque client value and is copied back untouched.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

/// Inbound frames larger than this are rejected before parsing.
pub const MAX_FRAME_SIZE: usize = 10 * 1024;

/// Kind tag of a plain-text segment.
pub const TEXT_SEGMENT: &str = "text";

// ============================================================================
// Inbound
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    Auth,
    Message,
    ApiCall,
    Heartbeat,
}

impl EnvelopeType {
    fn parse(kind: &str) -> Option<Self> {
        match kind {
            "auth" => Some(EnvelopeType::Auth),
            "message" => Some(EnvelopeType::Message),
            "api_call" => Some(EnvelopeType::ApiCall),
            "heartbeat" => Some(EnvelopeType::Heartbeat),
            _ => None,
        }
    }
}

/// A decoded client frame. The payload is interpreted by whichever
/// component handles the envelope type.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEnvelope {
    pub kind: EnvelopeType,
    pub echo: Option<Value>,
    pub payload: Value,
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    echo: Option<Value>,
    #[serde(default)]
    payload: Value,
}

/// Decodes a client frame.
pub fn decode(data: &[u8]) -> Result<InboundEnvelope, ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::OversizedFrame { size: data.len() });
    }

    let value: Value =
        serde_json::from_slice(data).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
    if !value.is_object() {
        return Err(ProtocolError::MalformedFrame("not an object".to_string()));
    }
    let raw: RawEnvelope =
        serde_json::from_value(value).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;

    let kind = raw
        .kind
        .ok_or_else(|| ProtocolError::MalformedFrame("missing type".to_string()))?;

    match EnvelopeType::parse(&kind) {
        Some(kind) => Ok(InboundEnvelope {
            kind,
            echo: raw.echo,
            payload: raw.payload,
        }),
        None => Err(ProtocolError::UnknownType {
            kind,
            echo: raw.echo,
        }),
    }
}

/// Claims carried by an `auth` envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AuthClaims {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default, deserialize_with = "lenient_id")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub nickname: Option<String>,
}

impl AuthClaims {
    /// Reads claims from an `auth` payload. Anything unreadable yields
    /// empty claims, which fail authentication.
    pub fn from_payload(payload: &Value) -> Self {
        serde_json::from_value(payload.clone()).unwrap_or_default()
    }
}

/// Payload of an `api_call` envelope.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiCallPayload {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub params: Value,
}

impl ApiCallPayload {
    /// Extracts the action name and params, requiring a non-empty action.
    pub fn from_payload(payload: &Value) -> Result<(String, Value), ProtocolError> {
        let call: ApiCallPayload = serde_json::from_value(payload.clone())
            .map_err(|_| ProtocolError::InvalidPayload("Invalid api_call format"))?;
        match call.action {
            Some(action) if !action.is_empty() => {
                let params = match call.params {
                    Value::Null => Value::Object(Map::new()),
                    other => other,
                };
                Ok((action, params))
            }
            _ => Err(ProtocolError::InvalidPayload("Invalid api_call format")),
        }
    }
}

/// Accepts ids sent either as JSON strings or numbers.
pub fn lenient_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(id_string))
}

/// String form of an id-like JSON value.
pub fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ============================================================================
// Message content
// ============================================================================

/// One unit of a structured chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Segment {
    pub fn text(text: impl Into<String>) -> Self {
        Segment {
            kind: TEXT_SEGMENT.to_string(),
            data: Value::String(text.into()),
        }
    }

    /// Converts one JSON value into a segment.
    ///
    /// Objects tagged with `kind` keep their `data`. Objects tagged with
    /// `type` (the older client format, e.g. `{"type":"text","text":"hi"}`)
    /// use the remaining fields as data, unwrapped when the only remaining
    /// field is named after the kind. Everything else becomes text.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => match tagged_segment(&map) {
                Some(segment) => segment,
                None => Segment::text(Value::Object(map).to_string()),
            },
            other => Segment::text(coerce_text(&other)),
        }
    }
}

fn tagged_segment(map: &Map<String, Value>) -> Option<Segment> {
    if let Some(Value::String(kind)) = map.get("kind") {
        return Some(Segment {
            kind: kind.clone(),
            data: map.get("data").cloned().unwrap_or(Value::Null),
        });
    }

    let Some(Value::String(kind)) = map.get("type") else {
        return None;
    };
    if let Some(data) = map.get("data") {
        return Some(Segment {
            kind: kind.clone(),
            data: data.clone(),
        });
    }
    let mut rest = map.clone();
    rest.remove("type");
    let data = if rest.len() == 1 && rest.contains_key(kind.as_str()) {
        rest.remove(kind.as_str()).unwrap_or(Value::Null)
    } else {
        Value::Object(rest)
    };
    Some(Segment {
        kind: kind.clone(),
        data,
    })
}

fn coerce_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Chat message content: a bare string or a sequence of segments.
///
/// Always serialized as a segment sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Text(String),
    Segments(Vec<Segment>),
}

impl Message {
    /// The single conversion from arbitrary client/host JSON into a message.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(s) => Message::Text(s),
            Value::Array(items) => {
                Message::Segments(items.into_iter().map(Segment::from_value).collect())
            }
            Value::Object(map) => match tagged_segment(&map) {
                Some(segment) => Message::Segments(vec![segment]),
                None => Message::Text(Value::Object(map).to_string()),
            },
            other => Message::Text(coerce_text(&other)),
        }
    }

    pub fn into_segments(self) -> Vec<Segment> {
        match self {
            Message::Text(text) => vec![Segment::text(text)],
            Message::Segments(segments) => segments,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Message::Text(text) => text.is_empty(),
            Message::Segments(segments) => segments.is_empty(),
        }
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_string())
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<Vec<Segment>> for Message {
    fn from(segments: Vec<Segment>) -> Self {
        Message::Segments(segments)
    }
}

impl From<Value> for Message {
    fn from(value: Value) -> Self {
        Message::from_value(value)
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Message::Text(text) => [Segment::text(text.as_str())].serialize(serializer),
            Message::Segments(segments) => segments.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Message::from_value)
    }
}

// ============================================================================
// Outbound
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectedPayload {
    #[serde(rename = "clientId")]
    pub client_id: String,
    pub server: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthResponsePayload {
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A chat message sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message: Message,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<String>,
}

impl MessagePayload {
    pub fn new(message: impl Into<Message>) -> Self {
        MessagePayload {
            message: message.into(),
            message_id: None,
            context: None,
            reply_to_message_id: None,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// Outcome status of an API call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiStatus {
    Ok,
    Failed,
    Error,
}

/// Result of an API call, sent back as the `api_response` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResult {
    pub status: ApiStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ApiResult {
    pub fn ok(data: Value) -> Self {
        ApiResult {
            status: ApiStatus::Ok,
            data: Some(data),
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        ApiResult {
            status: ApiStatus::Failed,
            data: None,
            message: Some(message.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ApiResult {
            status: ApiStatus::Error,
            data: None,
            message: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ApiStatus::Ok
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptPayload {
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoticePayload {
    pub notice_type: String,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundBody {
    Connected { payload: ConnectedPayload },
    AuthResponse { payload: AuthResponsePayload },
    Message { payload: MessagePayload },
    MessageReceipt { payload: ReceiptPayload },
    ApiResponse { payload: ApiResult },
    Notice { payload: NoticePayload },
    HeartbeatResponse { payload: HeartbeatPayload },
    Error { message: String },
}

/// A frame sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    #[serde(flatten)]
    pub body: OutboundBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub echo: Option<Value>,
}

impl OutboundEnvelope {
    fn new(body: OutboundBody, echo: Option<Value>) -> Self {
        OutboundEnvelope { body, echo }
    }

    pub fn connected(client_id: &str, server: &str) -> Self {
        Self::new(
            OutboundBody::Connected {
                payload: ConnectedPayload {
                    client_id: client_id.to_string(),
                    server: server.to_string(),
                },
            },
            None,
        )
    }

    pub fn auth_response(echo: Option<Value>, ok: bool, message: Option<String>) -> Self {
        let status = if ok {
            ResponseStatus::Ok
        } else {
            ResponseStatus::Failed
        };
        Self::new(
            OutboundBody::AuthResponse {
                payload: AuthResponsePayload { status, message },
            },
            echo,
        )
    }

    pub fn message(payload: MessagePayload) -> Self {
        Self::new(OutboundBody::Message { payload }, None)
    }

    pub fn receipt(echo: Option<Value>) -> Self {
        Self::new(
            OutboundBody::MessageReceipt {
                payload: ReceiptPayload {
                    status: "received".to_string(),
                },
            },
            echo,
        )
    }

    pub fn api_response(echo: Option<Value>, result: ApiResult) -> Self {
        Self::new(OutboundBody::ApiResponse { payload: result }, echo)
    }

    pub fn notice(notice_type: &str, message_id: &str, operator_id: Option<String>) -> Self {
        Self::new(
            OutboundBody::Notice {
                payload: NoticePayload {
                    notice_type: notice_type.to_string(),
                    message_id: message_id.to_string(),
                    operator_id,
                },
            },
            None,
        )
    }

    pub fn heartbeat_response(echo: Option<Value>) -> Self {
        Self::new(
            OutboundBody::HeartbeatResponse {
                payload: HeartbeatPayload {
                    timestamp: now_millis(),
                },
            },
            echo,
        )
    }

    pub fn error(echo: Option<Value>, message: impl Into<String>) -> Self {
        Self::new(
            OutboundBody::Error {
                message: message.into(),
            },
            echo,
        )
    }

    /// Ensures a `message` envelope carries a message id and returns it.
    ///
    /// Other envelope kinds get a fresh id that only identifies this
    /// delivery; their payload is left unchanged.
    pub fn assign_message_id(&mut self) -> String {
        match &mut self.body {
            OutboundBody::Message { payload } => payload
                .message_id
                .get_or_insert_with(new_message_id)
                .clone(),
            _ => new_message_id(),
        }
    }
}

/// Encodes an envelope as JSON text.
pub fn encode(envelope: &OutboundEnvelope) -> String {
    match serde_json::to_string(envelope) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("Failed to encode outbound envelope: {}", e);
            r#"{"type":"error","message":"Internal encoding error"}"#.to_string()
        }
    }
}

/// Generates a unique message id.
pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
