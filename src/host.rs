// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host Integration
//!
//! The host is the bot framework the gateway plugs into. It receives
//! normalized message events and drives outbound traffic through
//! [`HostApi`].

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::delivery::DeliveryResult;
use crate::gateway::GatewayCore;
use crate::normalizer::{MessageEvent, MessageType};
use crate::protocol::{ApiResult, Message, MessagePayload, OutboundEnvelope};
use crate::router::{ClientInfo, FriendInfo, GroupInfo, LoginInfo, MemberInfo, SendReport};

/// The bot's own identity as the host sees it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostIdentity {
    pub self_id: Option<String>,
    pub nickname: String,
}

/// Callbacks the gateway needs from its host.
pub trait Host: Send + Sync {
    /// Publishes a client message on the host's event bus.
    fn publish_event(&self, event_name: &str, event: MessageEvent);

    /// Returns the bot identity events and replies should carry.
    fn resolve_identity(&self) -> HostIdentity;
}

/// The currently bound host, if any, and the identity it supplied.
pub(crate) struct HostBinding {
    host: RwLock<Option<Arc<dyn Host>>>,
    identity: RwLock<HostIdentity>,
}

impl HostBinding {
    pub(crate) fn new(bot_nickname: &str) -> Self {
        HostBinding {
            host: RwLock::new(None),
            identity: RwLock::new(HostIdentity {
                self_id: None,
                nickname: bot_nickname.to_string(),
            }),
        }
    }

    /// Binds a host, replacing any previous one, and caches its identity.
    pub(crate) fn bind(&self, host: Arc<dyn Host>) -> HostIdentity {
        let mut identity = host.resolve_identity();
        {
            let mut current = self.identity.write().unwrap_or_else(PoisonError::into_inner);
            if identity.nickname.is_empty() {
                identity.nickname = current.nickname.clone();
            }
            *current = identity.clone();
        }
        *self.host.write().unwrap_or_else(PoisonError::into_inner) = Some(host);
        identity
    }

    pub(crate) fn identity(&self) -> HostIdentity {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Hands an event to the host. Returns false when no host is bound.
    pub(crate) fn publish(&self, event: MessageEvent) -> bool {
        let host = self
            .host
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match host {
            Some(host) => {
                let name = event.event_name();
                host.publish_event(&name, event);
                true
            }
            None => {
                error!(
                    "[{}] No host bound, dropping message {}",
                    event.source_session_id, event.message_id
                );
                false
            }
        }
    }
}

/// Where a host-originated message should go.
///
/// Resolution order: the originating session, then any of `to_id`,
/// `user_id`, `group_id` that names a live session, then a session whose
/// user id matches `to_id` or `user_id`. With no match the message is
/// broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingContext {
    pub from_session_id: Option<String>,
    pub to_id: Option<String>,
    pub user_id: Option<String>,
    pub group_id: Option<String>,
    pub message_type: MessageType,
}

impl RoutingContext {
    /// Context that routes straight back to the session an event came from.
    pub fn reply_to(event: &MessageEvent) -> Self {
        RoutingContext {
            from_session_id: Some(event.source_session_id.clone()),
            to_id: None,
            user_id: Some(event.user_id.clone()),
            group_id: event.group_id.clone(),
            message_type: event.message_type,
        }
    }

    fn client_context(&self, self_id: Option<&str>) -> Value {
        json!({
            "message_type": self.message_type,
            "user_id": self.user_id,
            "group_id": self.group_id,
            "sender_id": self_id,
        })
    }
}

/// Handle the host uses to talk to clients.
#[derive(Clone)]
pub struct HostApi {
    core: Arc<GatewayCore>,
}

impl HostApi {
    pub(crate) fn new(core: Arc<GatewayCore>) -> Self {
        HostApi { core }
    }

    pub fn identity(&self) -> HostIdentity {
        self.core.host.identity()
    }

    /// Sends a message according to `ctx`.
    pub fn send_msg(&self, ctx: &RoutingContext, message: impl Into<Message>) -> SendReport {
        let identity = self.identity();
        let payload = MessagePayload::new(message)
            .with_context(ctx.client_context(identity.self_id.as_deref()));
        let envelope = OutboundEnvelope::message(payload);

        if let Some(id) = ctx
            .from_session_id
            .as_deref()
            .filter(|id| self.core.registry.contains(id))
        {
            return SendReport::Unicast(self.core.delivery.unicast(id, envelope));
        }

        let target = [&ctx.to_id, &ctx.user_id, &ctx.group_id]
            .into_iter()
            .flatten()
            .find(|id| self.core.registry.contains(id.as_str()));
        let user_id = [&ctx.to_id, &ctx.user_id]
            .into_iter()
            .flatten()
            .find(|uid| self.core.registry.find_by_user_id(uid.as_str()).is_some());

        if target.is_none() && user_id.is_none() {
            info!("No target session in routing context, broadcasting");
        }
        self.core
            .router
            .route(target.map(String::as_str), user_id.map(String::as_str), envelope)
    }

    /// Sends a message to every connected client.
    pub fn broadcast(&self, message: impl Into<Message>) -> Vec<DeliveryResult> {
        let identity = self.identity();
        let payload = MessagePayload::new(message).with_context(json!({
            "message_type": MessageType::Group,
            "group_id": crate::normalizer::DEFAULT_GROUP_ID,
            "sender_id": identity.self_id,
        }));
        self.core
            .delivery
            .broadcast(OutboundEnvelope::message(payload))
    }

    /// Sends a message to one session, optionally quoting a message.
    pub fn reply(
        &self,
        session_id: &str,
        message: impl Into<Message>,
        reply_to: Option<&str>,
    ) -> DeliveryResult {
        let identity = self.identity();
        let mut payload = MessagePayload::new(message).with_context(json!({
            "sender_id": identity.self_id,
        }));
        payload.reply_to_message_id = reply_to.map(str::to_string);
        self.core
            .delivery
            .unicast(session_id, OutboundEnvelope::message(payload))
    }

    /// Replies to the session an event came from. Never broadcasts.
    pub fn reply_to_event(
        &self,
        event: &MessageEvent,
        message: impl Into<Message>,
        quote: bool,
    ) -> DeliveryResult {
        let identity = self.identity();
        let ctx = RoutingContext::reply_to(event);
        let mut payload = MessagePayload::new(message)
            .with_context(ctx.client_context(identity.self_id.as_deref()));
        if quote {
            payload.reply_to_message_id = Some(event.message_id.clone());
        }
        self.core
            .delivery
            .unicast(&event.source_session_id, OutboundEnvelope::message(payload))
    }

    /// Tells `session_id` a recall was requested, then broadcasts the
    /// recall notice. Returns true if any client received the notice.
    pub fn recall(&self, session_id: &str, message_id: &str) -> bool {
        let identity = self.identity();
        let attempt = self.core.delivery.unicast(
            session_id,
            OutboundEnvelope::notice("recall_attempt", message_id, identity.self_id.clone()),
        );
        if !attempt.ok {
            warn!("[{}] Could not notify recall attempt", session_id);
        }
        self.recall_msg(message_id)
    }

    /// Broadcasts a recall notice for `message_id`.
    pub fn recall_msg(&self, message_id: &str) -> bool {
        let identity = self.identity();
        self.core
            .delivery
            .broadcast_recall(message_id, identity.self_id)
    }

    /// Runs an API action as the host.
    pub fn send_api(&self, action: &str, params: Value) -> ApiResult {
        self.core.metrics.api_calls.inc();
        self.core
            .router
            .dispatch(None, action, &params, &self.identity())
    }

    pub fn login_info(&self) -> LoginInfo {
        self.core.router.login_info(&self.identity())
    }

    pub fn client_list(&self) -> Vec<ClientInfo> {
        self.core.router.client_list()
    }

    pub fn friend_list(&self) -> Vec<FriendInfo> {
        self.core.router.friend_list()
    }

    pub fn group_list(&self) -> Vec<GroupInfo> {
        self.core.router.group_list()
    }

    pub fn member_list(&self, group_id: &str) -> Vec<MemberInfo> {
        self.core.router.member_list(group_id, &self.identity())
    }
}

impl fmt::Debug for HostApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostApi")
            .field("identity", &self.identity())
            .finish()
    }
}
