// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! API Router
//!
//! Dispatches `api_call` actions, from clients or from the host, to the
//! registry and delivery layers. Every call produces an [`ApiResult`];
//! unknown actions fail without side effects.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::connection_registry::{ConnectionRegistry, Session};
use crate::delivery::{Delivery, DeliveryResult};
use crate::error::ProtocolError;
use crate::host::HostIdentity;
use crate::normalizer::DEFAULT_GROUP_ID;
use crate::protocol::{id_string, ApiResult, Message, MessagePayload, OutboundEnvelope};

/// Name reported for the single virtual group.
pub const DEFAULT_GROUP_NAME: &str = "WebChat Group";

/// One connected client as reported by `get_client_list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    #[serde(rename = "clientId")]
    pub client_id: String,
    pub user_id: String,
    pub nickname: String,
}

impl From<&Session> for ClientInfo {
    fn from(session: &Session) -> Self {
        ClientInfo {
            client_id: session.id.clone(),
            user_id: session.effective_user_id(),
            nickname: session.effective_nickname(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginInfo {
    pub user_id: Option<String>,
    pub nickname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendInfo {
    pub user_id: String,
    pub nickname: String,
    pub remark: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub group_id: String,
    pub group_name: String,
    pub member_count: usize,
    pub max_member_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub group_id: String,
    pub user_id: String,
    pub nickname: String,
    pub card: String,
    pub role: String,
}

/// Where a `send_msg` call ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendReport {
    Unicast(DeliveryResult),
    Broadcast(Vec<DeliveryResult>),
}

impl SendReport {
    pub fn into_api_result(self) -> ApiResult {
        match self {
            SendReport::Unicast(result) => {
                let ok = result.ok;
                let error = result.error.clone();
                let data = serde_json::to_value(result).unwrap_or(Value::Null);
                if ok {
                    ApiResult::ok(data)
                } else {
                    let mut failed = ApiResult::failed(error.unwrap_or_default());
                    failed.data = Some(data);
                    failed
                }
            }
            SendReport::Broadcast(results) => ApiResult::ok(json!({
                "broadcast_results": results,
            })),
        }
    }
}

#[derive(Clone)]
pub struct ApiRouter {
    registry: Arc<ConnectionRegistry>,
    delivery: Delivery,
}

impl ApiRouter {
    pub fn new(registry: Arc<ConnectionRegistry>, delivery: Delivery) -> Self {
        ApiRouter { registry, delivery }
    }

    /// Executes one action. `origin` is the calling session, or `None` when
    /// the host itself is calling.
    pub fn dispatch(
        &self,
        origin: Option<&str>,
        action: &str,
        params: &Value,
        identity: &HostIdentity,
    ) -> ApiResult {
        debug!("API call {} from {:?}", action, origin);

        match action {
            "send_msg" | "send_private_msg" | "send_group_msg" => {
                self.send_msg(params, identity)
            }
            "get_login_info" => to_result(&self.login_info(identity)),
            "get_client_list" => to_result(&self.client_list()),
            "get_friend_list" => to_result(&self.friend_list()),
            "get_group_list" => to_result(&self.group_list()),
            "get_group_member_list" => {
                let group_id = params
                    .get("group_id")
                    .and_then(id_string)
                    .unwrap_or_else(|| DEFAULT_GROUP_ID.to_string());
                to_result(&self.member_list(&group_id, identity))
            }
            "delete_msg" | "recall" => self.recall(params, identity),
            other => {
                warn!("Unknown API action: {}", other);
                ApiResult::failed(ProtocolError::UnknownAction(other.to_string()).to_string())
            }
        }
    }

    fn send_msg(&self, params: &Value, identity: &HostIdentity) -> ApiResult {
        let message = match params.get("message") {
            Some(value) if !value.is_null() => Message::from_value(value.clone()),
            _ => return ApiResult::failed("Missing message"),
        };

        let mut context = params.clone();
        if let Value::Object(map) = &mut context {
            map.remove("message");
            if let Some(self_id) = &identity.self_id {
                map.entry("sender_id")
                    .or_insert_with(|| Value::String(self_id.clone()));
            }
        }
        let envelope = OutboundEnvelope::message(MessagePayload::new(message).with_context(context));

        let targets: Vec<String> = ["client_id", "user_id", "group_id"]
            .iter()
            .filter_map(|key| params.get(*key).and_then(id_string))
            .collect();
        let target = targets
            .iter()
            .find(|id| self.registry.contains(id.as_str()))
            .or(targets.first())
            .cloned();
        let user_id = params.get("user_id").and_then(id_string);

        self.route(target.as_deref(), user_id.as_deref(), envelope)
            .into_api_result()
    }

    /// Unicasts to `target` if it names a live session, else to the session
    /// whose user id is `user_id`, else broadcasts.
    pub fn route(
        &self,
        target: Option<&str>,
        user_id: Option<&str>,
        envelope: OutboundEnvelope,
    ) -> SendReport {
        if let Some(id) = target.filter(|id| self.registry.contains(id)) {
            return SendReport::Unicast(self.delivery.unicast(id, envelope));
        }
        if let Some(session) = user_id.and_then(|uid| self.registry.find_by_user_id(uid)) {
            return SendReport::Unicast(self.delivery.unicast(&session.id, envelope));
        }
        if let Some(id) = target {
            warn!("Target {} not connected, broadcasting instead", id);
        }
        SendReport::Broadcast(self.delivery.broadcast(envelope))
    }

    fn recall(&self, params: &Value, identity: &HostIdentity) -> ApiResult {
        let Some(message_id) = params.get("message_id").and_then(id_string) else {
            return ApiResult::failed("Missing message_id");
        };
        let recalled = self
            .delivery
            .broadcast_recall(&message_id, identity.self_id.clone());
        if recalled {
            return ApiResult::ok(json!({ "recalled": true }));
        }
        let mut result = ApiResult::failed("No client received the recall");
        result.data = Some(json!({ "recalled": false }));
        result
    }

    pub fn login_info(&self, identity: &HostIdentity) -> LoginInfo {
        LoginInfo {
            user_id: identity.self_id.clone(),
            nickname: identity.nickname.clone(),
        }
    }

    /// One entry per live session, in no particular order.
    pub fn client_list(&self) -> Vec<ClientInfo> {
        self.registry.list().iter().map(ClientInfo::from).collect()
    }

    /// Authenticated sessions, one entry per distinct user id.
    pub fn friend_list(&self) -> Vec<FriendInfo> {
        let mut friends: Vec<FriendInfo> = Vec::new();
        for session in self.registry.list().iter().filter(|s| s.authenticated) {
            let user_id = session.effective_user_id();
            if friends.iter().any(|f| f.user_id == user_id) {
                continue;
            }
            let nickname = session.effective_nickname();
            friends.push(FriendInfo {
                user_id,
                remark: nickname.clone(),
                nickname,
            });
        }
        friends
    }

    pub fn group_list(&self) -> Vec<GroupInfo> {
        vec![GroupInfo {
            group_id: DEFAULT_GROUP_ID.to_string(),
            group_name: DEFAULT_GROUP_NAME.to_string(),
            member_count: self.friend_list().len(),
            max_member_count: 500,
        }]
    }

    /// Members of the virtual group: the bot first, then every
    /// authenticated user. Any other group has no members.
    pub fn member_list(&self, group_id: &str, identity: &HostIdentity) -> Vec<MemberInfo> {
        let mut members = Vec::new();
        if group_id != DEFAULT_GROUP_ID {
            return members;
        }
        if let Some(self_id) = &identity.self_id {
            members.push(MemberInfo {
                group_id: group_id.to_string(),
                user_id: self_id.clone(),
                nickname: identity.nickname.clone(),
                card: identity.nickname.clone(),
                role: "owner".to_string(),
            });
        }
        for friend in self.friend_list() {
            if identity.self_id.as_deref() == Some(friend.user_id.as_str()) {
                continue;
            }
            members.push(MemberInfo {
                group_id: group_id.to_string(),
                card: friend.nickname.clone(),
                user_id: friend.user_id,
                nickname: friend.nickname,
                role: "member".to_string(),
            });
        }
        members
    }
}

fn to_result<T: Serialize>(data: &T) -> ApiResult {
    match serde_json::to_value(data) {
        Ok(value) => ApiResult::ok(value),
        Err(e) => ApiResult::error(e.to_string()),
    }
}
