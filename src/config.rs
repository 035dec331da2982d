//! Gateway Configuration
//!
//! Configuration loaded from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use crate::connection_registry::DEFAULT_SEND_BUFFER;

/// Gateway configuration.
#[derive(Clone)]
pub struct GatewayConfig {
    /// Address the WebSocket listener binds to.
    pub listen_addr: SocketAddr,
    /// Request path clients must upgrade on.
    pub ws_path: String,
    /// Shared access token every client must present in its `auth` frame.
    pub access_token: String,
    /// Server name reported in the `connected` frame.
    pub server_name: String,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Time allowed to complete the WebSocket handshake, in seconds.
    pub handshake_timeout_secs: u64,
    /// Outbound frames queued per session before it counts as stalled.
    pub send_buffer: usize,
    /// Close the socket after a failed `auth` instead of letting the client retry.
    pub disconnect_on_auth_failure: bool,
    /// Bot nickname reported until the host supplies one.
    pub bot_nickname: String,
    /// Address of the HTTP metrics/health endpoint.
    pub metrics_addr: SocketAddr,
    /// Optional bearer token protecting `/metrics`.
    pub metrics_token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 2537)),
            ws_path: "/WebChat".to_string(),
            access_token: generate_access_token(),
            server_name: "WebChatAdapter".to_string(),
            max_connections: 1000,
            handshake_timeout_secs: 10,
            send_buffer: DEFAULT_SEND_BUFFER,
            disconnect_on_auth_failure: false,
            bot_nickname: "WebChat Bot".to_string(),
            metrics_addr: SocketAddr::from(([127, 0, 0, 1], 2538)),
            metrics_token: None,
        }
    }
}

/// Generates a random 32-character access token.
pub fn generate_access_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl GatewayConfig {
    /// Loads configuration from environment variables.
    ///
    /// Unparseable values are ignored and the default is kept.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("WEBCHAT_LISTEN_ADDR") {
            if let Ok(parsed) = addr.parse() {
                config.listen_addr = parsed;
            }
        }

        if let Some(path) = lookup("WEBCHAT_PATH") {
            if path.starts_with('/') {
                config.ws_path = path;
            }
        }

        if let Some(token) = lookup("WEBCHAT_ACCESS_TOKEN") {
            if !token.is_empty() {
                config.access_token = token;
            }
        }

        if let Some(name) = lookup("WEBCHAT_SERVER_NAME") {
            if !name.is_empty() {
                config.server_name = name;
            }
        }

        if let Some(val) = lookup("WEBCHAT_MAX_CONNECTIONS") {
            if let Ok(parsed) = val.parse() {
                config.max_connections = parsed;
            }
        }

        if let Some(val) = lookup("WEBCHAT_HANDSHAKE_TIMEOUT") {
            if let Ok(parsed) = val.parse() {
                config.handshake_timeout_secs = parsed;
            }
        }

        if let Some(val) = lookup("WEBCHAT_SEND_BUFFER") {
            if let Ok(parsed) = val.parse::<usize>() {
                if parsed > 0 {
                    config.send_buffer = parsed;
                }
            }
        }

        if let Some(val) = lookup("WEBCHAT_DISCONNECT_ON_AUTH_FAILURE") {
            if let Some(parsed) = parse_bool(&val) {
                config.disconnect_on_auth_failure = parsed;
            }
        }

        if let Some(name) = lookup("WEBCHAT_BOT_NICKNAME") {
            if !name.is_empty() {
                config.bot_nickname = name;
            }
        }

        if let Some(addr) = lookup("WEBCHAT_METRICS_ADDR") {
            if let Ok(parsed) = addr.parse() {
                config.metrics_addr = parsed;
            }
        }

        config.metrics_token = lookup("WEBCHAT_METRICS_TOKEN").filter(|t| !t.is_empty());

        config
    }

    /// Returns true if the access token was supplied explicitly rather than
    /// generated at startup.
    pub fn access_token_from(lookup: impl Fn(&str) -> Option<String>) -> bool {
        lookup("WEBCHAT_ACCESS_TOKEN").is_some_and(|t| !t.is_empty())
    }

    /// Returns the handshake timeout as a Duration.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// WebSocket URL clients connect to.
    pub fn ws_url(&self, addr: SocketAddr) -> String {
        format!("ws://{}{}", addr, self.ws_path)
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("listen_addr", &self.listen_addr)
            .field("ws_path", &self.ws_path)
            .field("access_token", &"<redacted>")
            .field("server_name", &self.server_name)
            .field("max_connections", &self.max_connections)
            .field("handshake_timeout_secs", &self.handshake_timeout_secs)
            .field("send_buffer", &self.send_buffer)
            .field("disconnect_on_auth_failure", &self.disconnect_on_auth_failure)
            .field("bot_nickname", &self.bot_nickname)
            .field("metrics_addr", &self.metrics_addr)
            .field("metrics_token", &self.metrics_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
