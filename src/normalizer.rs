// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Event Normalization
//!
//! Turns the payload of an authenticated `message` envelope into the
//! event shape the host's event bus expects.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connection_registry::Session;
use crate::error::ProtocolError;
use crate::protocol::{self, lenient_id, Message, Segment};

/// Group id used when a group message names none.
pub const DEFAULT_GROUP_ID: &str = "webchat_group";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Private,
    Group,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Private => "private",
            MessageType::Group => "group",
        }
    }

    fn default_sub_type(&self) -> &'static str {
        match self {
            MessageType::Private => "friend",
            MessageType::Group => "normal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    Master,
    Guest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sender {
    pub user_id: String,
    pub nickname: String,
    pub role: SenderRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card: Option<String>,
}

/// A client chat message in host shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub self_id: Option<String>,
    pub post_type: String,
    pub message_type: MessageType,
    pub sub_type: String,
    pub message_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub sender: Sender,
    pub raw_message: String,
    pub message: Vec<Segment>,
    /// Session that sent the message; replies go back to it only.
    pub source_session_id: String,
    pub timestamp: u64,
}

impl MessageEvent {
    /// Host event name, e.g. `message.private`.
    pub fn event_name(&self) -> String {
        format!("message.{}", self.message_type.as_str())
    }

    /// Routing context describing where this message came from.
    pub fn reply_context(&self) -> Value {
        serde_json::json!({
            "message_type": self.message_type,
            "user_id": self.user_id,
            "group_id": self.group_id,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct SenderHint {
    #[serde(default)]
    card: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InboundMessage {
    #[serde(default)]
    message_type: Option<MessageType>,
    #[serde(default)]
    message: Value,
    #[serde(default, deserialize_with = "lenient_id")]
    message_id: Option<String>,
    #[serde(default)]
    sub_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_id")]
    group_id: Option<String>,
    #[serde(default)]
    sender: Option<SenderHint>,
}

/// Builds the host event for a `message` payload sent by `session`.
pub fn normalize(
    payload: &Value,
    session: &Session,
    self_id: Option<&str>,
) -> Result<MessageEvent, ProtocolError> {
    let invalid = || ProtocolError::InvalidPayload("Invalid message format");

    let inbound: InboundMessage = serde_json::from_value(payload.clone()).map_err(|_| invalid())?;
    if inbound.message.is_null() {
        return Err(invalid());
    }
    let raw_message = match &inbound.message {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let message = Message::from_value(inbound.message);
    if message.is_empty() {
        return Err(invalid());
    }

    let message_type = inbound.message_type.unwrap_or_default();
    let sub_type = inbound
        .sub_type
        .unwrap_or_else(|| message_type.default_sub_type().to_string());
    let user_id = session.effective_user_id();
    let nickname = session.effective_nickname();
    let role = if session.authenticated {
        SenderRole::Master
    } else {
        SenderRole::Guest
    };

    let (group_id, card) = match message_type {
        MessageType::Group => (
            Some(
                inbound
                    .group_id
                    .unwrap_or_else(|| DEFAULT_GROUP_ID.to_string()),
            ),
            Some(
                inbound
                    .sender
                    .and_then(|s| s.card)
                    .unwrap_or_else(|| nickname.clone()),
            ),
        ),
        MessageType::Private => (None, None),
    };

    Ok(MessageEvent {
        self_id: self_id.map(str::to_string),
        post_type: "message".to_string(),
        message_type,
        sub_type,
        message_id: inbound
            .message_id
            .unwrap_or_else(protocol::new_message_id),
        user_id: user_id.clone(),
        group_id,
        sender: Sender {
            user_id,
            nickname,
            role,
            card,
        },
        raw_message,
        message: message.into_segments(),
        source_session_id: session.id.clone(),
        timestamp: protocol::now_millis(),
    })
}
