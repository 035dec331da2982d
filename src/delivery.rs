// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Outbound Delivery
//!
//! Unicast and broadcast of envelopes to connected sessions. Delivery
//! never waits on a socket: frames are queued to each session's writer and
//! a session whose queue is closed or full is evicted on the spot.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::connection_registry::{ConnectionRegistry, RegistryMessage};
use crate::error::DeliveryError;
use crate::metrics::GatewayMetrics;
use crate::protocol::{self, OutboundEnvelope};

/// Outcome of delivering one envelope to one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub client_id: String,
    pub ok: bool,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeliveryResult {
    fn delivered(client_id: &str, message_id: &str) -> Self {
        DeliveryResult {
            client_id: client_id.to_string(),
            ok: true,
            message_id: message_id.to_string(),
            error: None,
        }
    }

    fn failed(client_id: &str, message_id: &str, error: DeliveryError) -> Self {
        DeliveryResult {
            client_id: client_id.to_string(),
            ok: false,
            message_id: message_id.to_string(),
            error: Some(error.to_string()),
        }
    }
}

/// Sends envelopes to sessions held in the registry.
#[derive(Clone)]
pub struct Delivery {
    registry: Arc<ConnectionRegistry>,
    metrics: GatewayMetrics,
}

impl Delivery {
    pub fn new(registry: Arc<ConnectionRegistry>, metrics: GatewayMetrics) -> Self {
        Delivery { registry, metrics }
    }

    /// Sends an envelope to one session.
    pub fn unicast(&self, session_id: &str, mut envelope: OutboundEnvelope) -> DeliveryResult {
        let message_id = envelope.assign_message_id();
        let frame = protocol::encode(&envelope);
        self.send_frame(session_id, frame, &message_id)
    }

    /// Sends an envelope to every session present right now.
    ///
    /// Each session is attempted exactly once. A broken session is evicted
    /// and reported without affecting the others.
    pub fn broadcast(&self, mut envelope: OutboundEnvelope) -> Vec<DeliveryResult> {
        let message_id = envelope.assign_message_id();
        let frame = protocol::encode(&envelope);
        let sessions = self.registry.list();
        debug!(
            "Broadcasting message {} to {} clients",
            message_id,
            sessions.len()
        );

        sessions
            .iter()
            .map(|session| self.send_frame(&session.id, frame.clone(), &message_id))
            .collect()
    }

    /// Broadcasts a recall notice. Returns true if at least one session
    /// received it.
    pub fn broadcast_recall(&self, message_id: &str, operator_id: Option<String>) -> bool {
        let notice = OutboundEnvelope::notice("message_recall", message_id, operator_id);
        self.broadcast(notice).iter().any(|r| r.ok)
    }

    fn send_frame(&self, session_id: &str, frame: String, message_id: &str) -> DeliveryResult {
        match self
            .registry
            .try_send(session_id, RegistryMessage::Frame(frame))
        {
            Ok(()) => {
                self.metrics.messages_delivered.inc();
                DeliveryResult::delivered(session_id, message_id)
            }
            Err(error) => {
                self.metrics.delivery_failures.inc();
                match error {
                    DeliveryError::NotConnected => {
                        warn!("[{}] Client not found or connection not open", session_id);
                    }
                    DeliveryError::ConnectionClosed | DeliveryError::WriteFailed => {
                        warn!("[{}] Failed to send message: {}, evicting", session_id, error);
                        if self.registry.evict(session_id) {
                            self.metrics.sessions_evicted.inc();
                        }
                    }
                }
                DeliveryResult::failed(session_id, message_id, error)
            }
        }
    }
}
