// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! WebSocket Connection Handler
//!
//! Handles individual client connections: the HTTP peek and upgrade, the
//! per-session read/write loop, and the per-frame state machine.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::connection_registry::{RegistryMessage, SessionChannel};
use crate::error::ProtocolError;
use crate::gateway::{GatewayCore, SHUTDOWN_REASON};
use crate::normalizer;
use crate::protocol::{
    self, ApiCallPayload, AuthClaims, EnvelopeType, InboundEnvelope, OutboundEnvelope,
};

/// Why a session is hung up after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hangup {
    /// Failed auth with `disconnect_on_auth_failure` set.
    AuthFailed,
    /// The session is no longer registered, usually after an eviction.
    SessionGone,
}

impl Hangup {
    /// Close frame to send before dropping the socket, if any.
    pub fn close_frame(self) -> Option<CloseFrame<'static>> {
        match self {
            Hangup::AuthFailed => Some(CloseFrame {
                code: CloseCode::Policy,
                reason: "Authentication failed".into(),
            }),
            Hangup::SessionGone => None,
        }
    }
}

/// Replies produced by one inbound frame, and whether to hang up after
/// sending them.
#[derive(Debug, Default, PartialEq)]
pub struct FrameOutcome {
    pub replies: Vec<OutboundEnvelope>,
    pub hangup: Option<Hangup>,
}

impl FrameOutcome {
    fn reply(envelope: OutboundEnvelope) -> Self {
        FrameOutcome {
            replies: vec![envelope],
            hangup: None,
        }
    }

    fn rejected(echo: Option<serde_json::Value>, error: ProtocolError) -> Self {
        Self::reply(OutboundEnvelope::error(echo, error.to_string()))
    }
}

fn http_response(status: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    )
}

/// Largest request head inspected before deciding between plain HTTP and
/// a WebSocket upgrade.
const PEEK_LIMIT: usize = 2048;

/// Pause between peeks while the request head is still incomplete.
const PEEK_RETRY: Duration = Duration::from_millis(10);

enum Accepted {
    WebSocket(WebSocketStream<TcpStream>),
    Http,
}

/// Serves one accepted TCP connection until the client goes away.
///
/// Plain HTTP requests get a small JSON answer (`/health` reports
/// liveness). WebSocket upgrades on any path other than the configured
/// one are refused with 404. Reading the request head and the upgrade share
/// one deadline, so a client that never sends a byte still gives its
/// connection slot back.
pub async fn serve_socket(stream: TcpStream, remote_addr: SocketAddr, core: Arc<GatewayCore>) {
    match timeout(
        core.config.handshake_timeout(),
        accept_client(stream, remote_addr, &core),
    )
    .await
    {
        Ok(Ok(Accepted::WebSocket(ws_stream))) => {
            core.metrics.connections_total.inc();
            core.metrics.connections_active.inc();
            handle_connection(ws_stream, Some(remote_addr), core.clone()).await;
            core.metrics.connections_active.dec();
        }
        Ok(Ok(Accepted::Http)) => {}
        Ok(Err(e)) => {
            warn!("WebSocket handshake with {} failed: {}", remote_addr, e);
            core.metrics.connection_errors.inc();
        }
        Err(_) => {
            warn!("WebSocket handshake timeout from {}", remote_addr);
            core.metrics.connection_errors.inc();
        }
    }
}

/// Peeks until the request head is complete, the buffer is full, or the
/// client hung up. Returns the number of bytes peeked.
async fn peek_request_head(stream: &TcpStream, buf: &mut [u8]) -> std::io::Result<usize> {
    loop {
        let n = stream.peek(buf).await?;
        if n == 0 || n == buf.len() || buf[..n].windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(n);
        }
        tokio::time::sleep(PEEK_RETRY).await;
    }
}

async fn accept_client(
    stream: TcpStream,
    remote_addr: SocketAddr,
    core: &GatewayCore,
) -> Result<Accepted, WsError> {
    // Peek at the request head to detect HTTP request vs WebSocket upgrade
    let mut peek_buf = [0u8; PEEK_LIMIT];
    let n = peek_request_head(&stream, &mut peek_buf).await?;
    let peek_lower = String::from_utf8_lossy(&peek_buf[..n]).to_ascii_lowercase();
    let is_websocket_upgrade = peek_lower.contains("upgrade: websocket");

    if n > 0 && !is_websocket_upgrade && peek_lower.starts_with("get ") {
        let response = if peek_lower.starts_with("get /health") {
            let body = format!(
                r#"{{"status":"healthy","version":"{}","clients":{}}}"#,
                env!("CARGO_PKG_VERSION"),
                core.registry.connected_count()
            );
            http_response("200 OK", &body)
        } else {
            http_response(
                "200 OK",
                r#"{"error":"This is a WebSocket chat endpoint"}"#,
            )
        };
        let mut stream = stream;
        let _ = stream.write_all(response.as_bytes()).await;
        let _ = stream.shutdown().await;
        debug!("Handled HTTP request from {}", remote_addr);
        return Ok(Accepted::Http);
    }

    let ws_path = core.config.ws_path.clone();
    let check_path = move |request: &Request, response: Response| {
        if request.uri().path() == ws_path {
            Ok(response)
        } else {
            let mut rejection = ErrorResponse::new(Some("Not Found".to_string()));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        }
    };

    let ws_stream = accept_hdr_async(stream, check_path).await?;
    Ok(Accepted::WebSocket(ws_stream))
}

/// Runs one client session.
///
/// The loop selects over three sources: frames from the client, frames
/// queued for the client through the registry, and the kill signal raised
/// when the session is evicted. The session is unregistered on every exit
/// path.
pub async fn handle_connection(
    mut ws_stream: WebSocketStream<TcpStream>,
    remote_addr: Option<SocketAddr>,
    core: Arc<GatewayCore>,
) {
    let SessionChannel {
        session_id,
        mut receiver,
        kill,
    } = match core.registry.register(remote_addr) {
        Ok(channel) => channel,
        Err(e) => {
            debug!("Refusing {:?}: {}", remote_addr, e);
            let frame = CloseFrame {
                code: CloseCode::Away,
                reason: SHUTDOWN_REASON.into(),
            };
            let _ = ws_stream.close(Some(frame)).await;
            return;
        }
    };
    let session = session_id.as_str();
    info!("[{}] Client connected from {:?}", session, remote_addr);

    let (mut write, mut read) = ws_stream.split();

    let connected = OutboundEnvelope::connected(session, &core.config.server_name);
    if let Err(e) = write.send(Message::Text(protocol::encode(&connected))).await {
        warn!("[{}] Failed to send connected frame: {}", session, e);
        core.registry.unregister(session);
        return;
    }

    'session: loop {
        tokio::select! {
            _ = kill.notified() => {
                warn!("[{}] Session evicted, dropping socket", session);
                break;
            }

            outgoing = receiver.recv() => match outgoing {
                Some(RegistryMessage::Frame(data)) => {
                    if let Err(e) = write.send(Message::Text(data)).await {
                        warn!("[{}] Write failed: {}", session, e);
                        break;
                    }
                }
                Some(RegistryMessage::Close { reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::Away,
                        reason: reason.into(),
                    };
                    let _ = write.send(Message::Close(Some(frame))).await;
                    break;
                }
                // Registry entry is gone (shutdown drain or eviction)
                None => break,
            },

            incoming = read.next() => {
                let data = match incoming {
                    Some(Ok(Message::Text(text))) => text.into_bytes(),
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!("[{}] Read error: {}", session, e);
                        break;
                    }
                };

                let outcome = process_frame(&core, session, &data);
                for reply in &outcome.replies {
                    if let Err(e) = write.send(Message::Text(protocol::encode(reply))).await {
                        warn!("[{}] Write failed: {}", session, e);
                        break 'session;
                    }
                }
                if let Some(hangup) = outcome.hangup {
                    if let Some(frame) = hangup.close_frame() {
                        let _ = write.send(Message::Close(Some(frame))).await;
                    }
                    break;
                }
            }
        }
    }

    core.registry.unregister(session);
    info!("[{}] Client disconnected", session);
}

/// Handles one inbound frame for `session_id` and returns the replies.
///
/// Never fails: every problem becomes an `error` reply and the session
/// stays open.
pub fn process_frame(core: &GatewayCore, session_id: &str, data: &[u8]) -> FrameOutcome {
    core.metrics.frames_received.inc();

    let envelope = match protocol::decode(data) {
        Ok(envelope) => envelope,
        Err(e) => {
            core.metrics.frames_rejected.inc();
            warn!("[{}] Rejected frame: {}", session_id, e);
            let echo = e.echo();
            return FrameOutcome::rejected(echo, e);
        }
    };

    match envelope.kind {
        EnvelopeType::Auth => handle_auth(core, session_id, envelope),
        EnvelopeType::Heartbeat => {
            FrameOutcome::reply(OutboundEnvelope::heartbeat_response(envelope.echo))
        }
        EnvelopeType::Message | EnvelopeType::ApiCall => {
            let Some(session) = core.registry.get(session_id) else {
                error!("[{}] Frame for unregistered session", session_id);
                return FrameOutcome {
                    replies: Vec::new(),
                    hangup: Some(Hangup::SessionGone),
                };
            };
            if !session.authenticated {
                core.metrics.frames_rejected.inc();
                return FrameOutcome::rejected(envelope.echo, ProtocolError::Unauthenticated);
            }

            if envelope.kind == EnvelopeType::Message {
                handle_message(core, &session, envelope)
            } else {
                handle_api_call(core, session_id, envelope)
            }
        }
    }
}

fn handle_auth(core: &GatewayCore, session_id: &str, envelope: InboundEnvelope) -> FrameOutcome {
    let claims = AuthClaims::from_payload(&envelope.payload);
    let result = core
        .authenticator
        .authenticate(&core.registry, session_id, &claims);

    if result.ok {
        return FrameOutcome::reply(OutboundEnvelope::auth_response(envelope.echo, true, None));
    }

    core.metrics.auth_failures.inc();
    warn!(
        "[{}] Authentication failed: {}",
        session_id,
        result.reason.as_deref().unwrap_or("unknown")
    );
    FrameOutcome {
        replies: vec![OutboundEnvelope::auth_response(
            envelope.echo,
            false,
            result.reason,
        )],
        hangup: core
            .config
            .disconnect_on_auth_failure
            .then_some(Hangup::AuthFailed),
    }
}

fn handle_message(
    core: &GatewayCore,
    session: &crate::connection_registry::Session,
    envelope: InboundEnvelope,
) -> FrameOutcome {
    let identity = core.host.identity();
    let event = match normalizer::normalize(
        &envelope.payload,
        session,
        identity.self_id.as_deref(),
    ) {
        Ok(event) => event,
        Err(e) => {
            core.metrics.frames_rejected.inc();
            return FrameOutcome::rejected(envelope.echo, e);
        }
    };

    debug!(
        "[{}] Message {} from {}",
        session.id, event.message_id, event.user_id
    );
    if core.host.publish(event) {
        core.metrics.events_published.inc();
    }
    FrameOutcome::reply(OutboundEnvelope::receipt(envelope.echo))
}

fn handle_api_call(core: &GatewayCore, session_id: &str, envelope: InboundEnvelope) -> FrameOutcome {
    let (action, params) = match ApiCallPayload::from_payload(&envelope.payload) {
        Ok(call) => call,
        Err(e) => {
            core.metrics.frames_rejected.inc();
            return FrameOutcome::rejected(envelope.echo, e);
        }
    };

    core.metrics.api_calls.inc();
    let result = core
        .router
        .dispatch(Some(session_id), &action, &params, &core.host.identity());
    FrameOutcome::reply(OutboundEnvelope::api_response(envelope.echo, result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::gateway::Gateway;
    use crate::host::{Host, HostIdentity};
    use crate::normalizer::MessageEvent;
    use crate::protocol::{ApiStatus, OutboundBody, ResponseStatus, MAX_FRAME_SIZE};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<MessageEvent>>,
    }

    impl Host for Recorder {
        fn publish_event(&self, _event_name: &str, event: MessageEvent) {
            self.events.lock().unwrap().push(event);
        }

        fn resolve_identity(&self) -> HostIdentity {
            HostIdentity {
                self_id: Some("bot".to_string()),
                nickname: "Bot".to_string(),
            }
        }
    }

    struct Fixture {
        core: Arc<GatewayCore>,
        recorder: Arc<Recorder>,
        session_id: String,
        _channel: SessionChannel,
    }

    fn fixture(disconnect_on_auth_failure: bool) -> Fixture {
        let gateway = Gateway::new(GatewayConfig {
            access_token: "T".to_string(),
            disconnect_on_auth_failure,
            ..GatewayConfig::default()
        });
        let core = gateway.core();
        let recorder = Arc::new(Recorder::default());
        core.host.bind(recorder.clone());
        let channel = core.registry.register(None).unwrap();
        Fixture {
            core,
            recorder,
            session_id: channel.session_id.clone(),
            _channel: channel,
        }
    }

    fn run(f: &Fixture, frame: serde_json::Value) -> FrameOutcome {
        process_frame(&f.core, &f.session_id, frame.to_string().as_bytes())
    }

    fn single(outcome: FrameOutcome) -> OutboundEnvelope {
        assert_eq!(outcome.replies.len(), 1);
        outcome.replies.into_iter().next().unwrap()
    }

    fn error_message(envelope: &OutboundEnvelope) -> &str {
        match &envelope.body {
            OutboundBody::Error { message } => message,
            other => panic!("Expected error, got {:?}", other),
        }
    }

    fn authenticate(f: &Fixture) {
        let reply = single(run(f, json!({"type": "auth", "payload": {"token": "T", "user_id": "alice"}})));
        assert!(matches!(
            reply.body,
            OutboundBody::AuthResponse { ref payload } if payload.status == ResponseStatus::Ok
        ));
    }

    #[test]
    fn test_message_before_auth_is_rejected() {
        let f = fixture(false);
        let reply = single(run(&f, json!({"type": "message", "echo": "e1", "payload": {"message": "hi"}})));

        assert_eq!(error_message(&reply), "Authentication required");
        assert_eq!(reply.echo, Some(json!("e1")));
        assert!(f.recorder.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_authenticated_message_is_published() {
        let f = fixture(false);
        authenticate(&f);

        let reply = single(run(&f, json!({"type": "message", "echo": 5, "payload": {"message": "hi"}})));
        assert!(matches!(reply.body, OutboundBody::MessageReceipt { .. }));
        assert_eq!(reply.echo, Some(json!(5)));

        let events = f.recorder.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].user_id, "alice");
        assert_eq!(events[0].self_id.as_deref(), Some("bot"));
        assert_eq!(events[0].source_session_id, f.session_id);
    }

    #[test]
    fn test_wrong_token_keeps_connection_by_default() {
        let f = fixture(false);
        let outcome = run(&f, json!({"type": "auth", "echo": "a", "payload": {"token": "nope"}}));
        assert_eq!(outcome.hangup, None);

        let reply = single(outcome);
        match reply.body {
            OutboundBody::AuthResponse { payload } => {
                assert_eq!(payload.status, ResponseStatus::Failed);
                assert_eq!(payload.message.as_deref(), Some("Invalid token"));
            }
            other => panic!("Expected auth_response, got {:?}", other),
        }
    }

    #[test]
    fn test_wrong_token_disconnects_when_configured() {
        let f = fixture(true);
        let outcome = run(&f, json!({"type": "auth", "payload": {"token": "nope"}}));
        assert_eq!(outcome.hangup, Some(Hangup::AuthFailed));
        assert_eq!(outcome.replies.len(), 1);

        let frame = Hangup::AuthFailed.close_frame().unwrap();
        assert_eq!(frame.code, CloseCode::Policy);
        assert_eq!(frame.reason, "Authentication failed");
    }

    #[test]
    fn test_oversized_frame() {
        let f = fixture(false);
        let frame = vec![b'x'; MAX_FRAME_SIZE + 1];
        let reply = single(process_frame(&f.core, &f.session_id, &frame));
        assert_eq!(error_message(&reply), "Message too large");
    }

    #[test]
    fn test_malformed_frame() {
        let f = fixture(false);
        let reply = single(process_frame(&f.core, &f.session_id, b"{oops"));
        assert_eq!(error_message(&reply), "Invalid JSON format");
        assert!(reply.echo.is_none());
    }

    #[test]
    fn test_unknown_type_echoes() {
        let f = fixture(false);
        let reply = single(run(&f, json!({"type": "subscribe", "echo": "z"})));
        assert_eq!(error_message(&reply), "Unknown message type: subscribe");
        assert_eq!(reply.echo, Some(json!("z")));
    }

    #[test]
    fn test_heartbeat_needs_no_auth() {
        let f = fixture(false);
        let reply = single(run(&f, json!({"type": "heartbeat", "echo": "hb"})));
        assert!(matches!(reply.body, OutboundBody::HeartbeatResponse { .. }));
        assert_eq!(reply.echo, Some(json!("hb")));
    }

    #[test]
    fn test_invalid_message_payload() {
        let f = fixture(false);
        authenticate(&f);
        let reply = single(run(&f, json!({"type": "message", "payload": {"message": ""}})));
        assert_eq!(error_message(&reply), "Invalid message format");
    }

    #[test]
    fn test_api_call_always_answers() {
        let f = fixture(false);
        authenticate(&f);

        let reply = single(run(&f, json!({"type": "api_call", "payload": {"action": "get_login_info"}})));
        match reply.body {
            OutboundBody::ApiResponse { payload } => {
                assert_eq!(payload.status, ApiStatus::Ok);
                assert_eq!(payload.data.unwrap()["user_id"], "bot");
            }
            other => panic!("Expected api_response, got {:?}", other),
        }

        let reply = single(run(&f, json!({"type": "api_call", "echo": 1, "payload": {"action": "nope"}})));
        match reply.body {
            OutboundBody::ApiResponse { payload } => {
                assert_eq!(payload.status, ApiStatus::Failed);
                assert_eq!(payload.message.as_deref(), Some("Action 'nope' not implemented"));
            }
            other => panic!("Expected api_response, got {:?}", other),
        }
    }

    #[test]
    fn test_api_call_without_action() {
        let f = fixture(false);
        authenticate(&f);
        let reply = single(run(&f, json!({"type": "api_call", "payload": {}})));
        assert_eq!(error_message(&reply), "Invalid api_call format");
    }

    #[test]
    fn test_api_call_before_auth_is_rejected() {
        let f = fixture(false);
        let reply = single(run(
            &f,
            json!({"type": "api_call", "echo": "c1", "payload": {"action": "get_client_list"}}),
        ));

        assert_eq!(error_message(&reply), "Authentication required");
        assert_eq!(reply.echo, Some(json!("c1")));
        assert_eq!(f.core.metrics.api_calls.get(), 0);
    }

    #[test]
    fn test_frame_for_evicted_session_hangs_up_without_auth_close() {
        let f = fixture(false);
        f.core.registry.evict(&f.session_id);
        let outcome = run(&f, json!({"type": "message", "payload": {"message": "x"}}));

        assert_eq!(outcome.hangup, Some(Hangup::SessionGone));
        assert!(outcome.replies.is_empty());
        assert!(Hangup::SessionGone.close_frame().is_none());
    }
}
