// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Gateway Errors
//!
//! The `Display` text of [`ProtocolError`] and [`DeliveryError`] is what
//! clients see in `error` envelopes and failed delivery results.

use std::net::SocketAddr;

use serde_json::Value;
use thiserror::Error;

/// Failures while handling a single inbound frame.
///
/// None of these close the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Message too large")]
    OversizedFrame { size: usize },

    #[error("Invalid JSON format")]
    MalformedFrame(String),

    #[error("Unknown message type: {kind}")]
    UnknownType { kind: String, echo: Option<Value> },

    #[error("Authentication required")]
    Unauthenticated,

    #[error("{0}")]
    InvalidPayload(&'static str),

    #[error("Action '{0}' not implemented")]
    UnknownAction(String),
}

impl ProtocolError {
    /// Echo token recovered from a frame that failed after the envelope
    /// itself was readable.
    pub fn echo(&self) -> Option<Value> {
        match self {
            ProtocolError::UnknownType { echo, .. } => echo.clone(),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session id {0} is already registered")]
    DuplicateId(String),
    #[error("registry is closed for shutdown")]
    Closed,
}

/// Why a frame could not be handed to a session's writer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Client not connected")]
    NotConnected,

    #[error("Connection not open")]
    ConnectionClosed,

    #[error("Failed to send")]
    WriteFailed,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to bind WebSocket listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read local address of listener: {0}")]
    LocalAddr(#[source] std::io::Error),
}
