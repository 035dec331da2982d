// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! WebSocket integration tests for the gateway.
//!
//! These tests start a real gateway, connect via WebSocket, and exercise
//! the full client/host flow end-to-end. Each test binds to port 0 for
//! isolation.

mod common;

use std::time::Duration;

use futures_util::StreamExt;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

use common::*;
use webchat_gateway::normalizer::{MessageType, SenderRole};
use webchat_gateway::protocol::MAX_FRAME_SIZE;
use webchat_gateway::router::SendReport;
use webchat_gateway::{Gateway, GatewayConfig, GatewayState, RoutingContext, Segment};

// ============================================================================
// Connection and auth
// ============================================================================

#[tokio::test]
async fn test_connected_frame_carries_session_id() {
    let gw = start_gateway().await;
    let (_ws, session_id) = connect_client(&gw).await;

    assert!(!session_id.is_empty());
    assert!(gw.gateway.registry().contains(&session_id));
}

#[tokio::test]
async fn test_auth_then_message_publishes_event() {
    let gw = start_gateway().await;
    let (mut ws, session_id) = connect_authed(&gw, "alice").await;

    send_json(
        &mut ws,
        &json!({"type": "message", "echo": "m1", "payload": {"message": "hello"}}),
    )
    .await;
    let receipt = recv_json(&mut ws).await;
    assert_eq!(receipt["type"], "message_receipt");
    assert_eq!(receipt["echo"], "m1");
    assert_eq!(receipt["payload"]["status"], "received");

    let events = gw.host.events();
    assert_eq!(events.len(), 1);
    let (name, event) = &events[0];
    assert_eq!(name, "message.private");
    assert_eq!(event.message_type, MessageType::Private);
    assert_eq!(event.sender.role, SenderRole::Master);
    assert_eq!(event.user_id, "alice");
    assert_eq!(event.self_id.as_deref(), Some("bot"));
    assert_eq!(event.message, vec![Segment::text("hello")]);
    assert_eq!(event.source_session_id, session_id);
}

#[tokio::test]
async fn test_message_before_auth_is_rejected() {
    let gw = start_gateway().await;
    let (mut ws, _) = connect_client(&gw).await;

    send_json(
        &mut ws,
        &json!({"type": "message", "echo": 3, "payload": {"message": "hi"}}),
    )
    .await;
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["message"], "Authentication required");
    assert_eq!(reply["echo"], 3);
    assert!(gw.host.events().is_empty());
}

#[tokio::test]
async fn test_api_call_before_auth_is_rejected() {
    let gw = start_gateway().await;
    let (mut ws, _) = connect_client(&gw).await;

    send_json(
        &mut ws,
        &json!({"type": "api_call", "echo": "list-1", "payload": {"action": "get_client_list"}}),
    )
    .await;
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["message"], "Authentication required");
    assert_eq!(reply["echo"], "list-1");

    // No api_response follows the rejection.
    assert_silent(&mut ws).await;
}

#[tokio::test]
async fn test_wrong_token_keeps_socket_open() {
    let gw = start_gateway().await;
    let (mut ws, _) = connect_client(&gw).await;

    send_json(&mut ws, &json!({"type": "auth", "payload": {"token": "wrong"}})).await;
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["payload"]["status"], "failed");
    assert_eq!(reply["payload"]["message"], "Invalid token");

    // A retry with the right token still works on the same socket.
    send_json(&mut ws, &json!({"type": "auth", "payload": {"token": TEST_TOKEN}})).await;
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["payload"]["status"], "ok");
}

#[tokio::test]
async fn test_wrong_token_disconnects_when_configured() {
    let gw = start_gateway_with(GatewayConfig {
        disconnect_on_auth_failure: true,
        ..test_config()
    })
    .await;
    let (mut ws, session_id) = connect_client(&gw).await;

    send_json(&mut ws, &json!({"type": "auth", "payload": {"token": "wrong"}})).await;
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["payload"]["status"], "failed");

    let next = timeout(Duration::from_secs(2), ws.next()).await.unwrap();
    assert!(matches!(next, Some(Ok(Message::Close(_))) | None | Some(Err(_))));
    let registry = gw.gateway.registry().clone();
    wait_until(|| !registry.contains(&session_id)).await;
}

// ============================================================================
// Malformed input
// ============================================================================

#[tokio::test]
async fn test_oversized_frame_is_rejected() {
    let gw = start_gateway().await;
    let (mut ws, _) = connect_authed(&gw, "alice").await;

    let big = "x".repeat(MAX_FRAME_SIZE + 1);
    send_json(&mut ws, &json!({"type": "message", "payload": {"message": big}})).await;
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["message"], "Message too large");
    assert!(gw.host.events().is_empty());

    // The session survives.
    send_json(&mut ws, &json!({"type": "heartbeat"})).await;
    assert_eq!(recv_json(&mut ws).await["type"], "heartbeat_response");
}

#[tokio::test]
async fn test_malformed_frame_is_rejected() {
    let gw = start_gateway().await;
    let (mut ws, _) = connect_client(&gw).await;

    use futures_util::SinkExt;
    ws.send(Message::Text("{not json".to_string())).await.unwrap();
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["message"], "Invalid JSON format");
}

#[tokio::test]
async fn test_unknown_type_is_rejected_with_echo() {
    let gw = start_gateway().await;
    let (mut ws, _) = connect_client(&gw).await;

    send_json(&mut ws, &json!({"type": "subscribe", "echo": "u1"})).await;
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["message"], "Unknown message type: subscribe");
    assert_eq!(reply["echo"], "u1");
}

#[tokio::test]
async fn test_heartbeat_is_answered() {
    let gw = start_gateway().await;
    let (mut ws, _) = connect_client(&gw).await;

    send_json(&mut ws, &json!({"type": "heartbeat", "echo": {"n": 1}})).await;
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "heartbeat_response");
    assert_eq!(reply["echo"], json!({"n": 1}));
    assert!(reply["payload"]["timestamp"].as_u64().unwrap() > 0);
}

// ============================================================================
// API calls
// ============================================================================

#[tokio::test]
async fn test_client_list_reports_every_session() {
    let gw = start_gateway().await;
    let (mut a, a_id) = connect_authed(&gw, "alice").await;
    let (_b, b_id) = connect_authed(&gw, "bob").await;

    send_json(
        &mut a,
        &json!({"type": "api_call", "echo": "c", "payload": {"action": "get_client_list"}}),
    )
    .await;
    let reply = recv_json(&mut a).await;
    assert_eq!(reply["type"], "api_response");
    assert_eq!(reply["echo"], "c");
    assert_eq!(reply["payload"]["status"], "ok");

    let clients = reply["payload"]["data"].as_array().unwrap();
    assert_eq!(clients.len(), 2);
    let ids: Vec<&str> = clients
        .iter()
        .map(|c| c["clientId"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&a_id.as_str()));
    assert!(ids.contains(&b_id.as_str()));
}

#[tokio::test]
async fn test_client_send_msg_reaches_target_only() {
    let gw = start_gateway().await;
    let (mut a, _) = connect_authed(&gw, "alice").await;
    let (mut b, b_id) = connect_authed(&gw, "bob").await;

    send_json(
        &mut a,
        &json!({
            "type": "api_call",
            "payload": {"action": "send_msg", "params": {"client_id": b_id, "message": "yo"}}
        }),
    )
    .await;
    let reply = recv_json(&mut a).await;
    assert_eq!(reply["payload"]["status"], "ok");

    let delivered = recv_json(&mut b).await;
    assert_eq!(delivered["type"], "message");
    assert_eq!(
        delivered["payload"]["message"],
        json!([{"kind": "text", "data": "yo"}])
    );
    assert_silent(&mut a).await;
}

#[tokio::test]
async fn test_unknown_action_gets_failed_response() {
    let gw = start_gateway().await;
    let (mut ws, _) = connect_authed(&gw, "alice").await;

    send_json(
        &mut ws,
        &json!({"type": "api_call", "payload": {"action": "kick_everyone"}}),
    )
    .await;
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "api_response");
    assert_eq!(reply["payload"]["status"], "failed");
    assert_eq!(
        reply["payload"]["message"],
        "Action 'kick_everyone' not implemented"
    );
}

// ============================================================================
// Host-originated traffic
// ============================================================================

#[tokio::test]
async fn test_reply_to_event_goes_to_source_session() {
    let gw = start_gateway().await;
    let (mut a, _) = connect_authed(&gw, "alice").await;
    let (mut b, _) = connect_authed(&gw, "bob").await;

    send_json(&mut a, &json!({"type": "message", "payload": {"message": "ping"}})).await;
    recv_json(&mut a).await;

    let (_, event) = gw.host.events().remove(0);
    let result = gw.api.reply_to_event(&event, "pong", true);
    assert!(result.ok);

    let reply = recv_json(&mut a).await;
    assert_eq!(reply["type"], "message");
    assert_eq!(reply["payload"]["message"], json!([{"kind": "text", "data": "pong"}]));
    assert_eq!(reply["payload"]["reply_to_message_id"], event.message_id.as_str());
    assert_eq!(reply["payload"]["message_id"], result.message_id.as_str());
    assert_eq!(reply["payload"]["context"]["sender_id"], "bot");
    assert_silent(&mut b).await;
}

#[tokio::test]
async fn test_send_msg_by_user_id_and_broadcast_fallback() {
    let gw = start_gateway().await;
    let (mut a, _) = connect_authed(&gw, "alice").await;
    let (mut b, _) = connect_authed(&gw, "bob").await;

    let report = gw.api.send_msg(
        &RoutingContext {
            user_id: Some("bob".to_string()),
            ..RoutingContext::default()
        },
        "only bob",
    );
    assert!(matches!(report, SendReport::Unicast(ref r) if r.ok));
    assert_eq!(recv_json(&mut b).await["type"], "message");
    assert_silent(&mut a).await;

    let report = gw.api.send_msg(
        &RoutingContext {
            user_id: Some("nobody".to_string()),
            ..RoutingContext::default()
        },
        "everyone",
    );
    match report {
        SendReport::Broadcast(results) => {
            assert_eq!(results.len(), 2);
            assert!(results.iter().all(|r| r.ok));
        }
        other => panic!("Expected broadcast, got {:?}", other),
    }
    assert_eq!(recv_json(&mut a).await["type"], "message");
    assert_eq!(recv_json(&mut b).await["type"], "message");
}

#[tokio::test]
async fn test_recall_notifies_everyone() {
    let gw = start_gateway().await;
    let (mut a, a_id) = connect_authed(&gw, "alice").await;
    let (mut b, _) = connect_authed(&gw, "bob").await;

    assert!(gw.api.recall(&a_id, "m-42"));

    let attempt = recv_json(&mut a).await;
    assert_eq!(attempt["payload"]["notice_type"], "recall_attempt");
    let notice = recv_json(&mut a).await;
    assert_eq!(notice["payload"]["notice_type"], "message_recall");
    assert_eq!(notice["payload"]["message_id"], "m-42");
    let notice = recv_json(&mut b).await;
    assert_eq!(notice["payload"]["notice_type"], "message_recall");
}

#[tokio::test]
async fn test_closed_client_is_removed() {
    let gw = start_gateway().await;
    let (mut ws, session_id) = connect_authed(&gw, "alice").await;

    ws.close(None).await.unwrap();
    let registry = gw.gateway.registry().clone();
    wait_until(|| !registry.contains(&session_id)).await;

    let result = gw.api.reply(&session_id, "too late", None);
    assert!(!result.ok);
    assert_eq!(result.error.as_deref(), Some("Client not connected"));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_unload_closes_clients_with_going_away() {
    let gw = start_gateway().await;
    let (mut ws, _) = connect_authed(&gw, "alice").await;

    gw.gateway.unload().await;

    let notice = recv_json(&mut ws).await;
    assert_eq!(notice["type"], "notice");
    assert_eq!(notice["payload"]["notice_type"], "server_shutdown");

    let next = timeout(Duration::from_secs(2), ws.next()).await.unwrap();
    match next {
        Some(Ok(Message::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Away),
        other => panic!("Expected close frame, got {:?}", other),
    }
    assert_eq!(gw.gateway.state().await, GatewayState::Uninitialized);
    assert_eq!(gw.gateway.registry().connected_count(), 0);
    assert!(connect_async(gw.url()).await.is_err());
}

#[tokio::test]
async fn test_gateway_can_be_reloaded() {
    let gw = start_gateway().await;
    gw.gateway.unload().await;

    let addr = gw.gateway.load().await.unwrap();
    assert_eq!(gw.gateway.state().await, GatewayState::Listening(addr));
    gw.gateway.unload().await;
}

#[tokio::test]
async fn test_bind_failure_leaves_gateway_uninitialized() {
    let gw = start_gateway().await;

    let second = Gateway::new(GatewayConfig {
        listen_addr: gw.addr,
        ..test_config()
    });
    assert!(second
        .connect(std::sync::Arc::new(RecordingHost::default()))
        .await
        .is_err());
    assert_eq!(second.state().await, GatewayState::Uninitialized);
}

// ============================================================================
// HTTP on the WebSocket port
// ============================================================================

async fn raw_http(addr: std::net::SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    timeout(Duration::from_secs(2), stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    response
}

#[tokio::test]
async fn test_health_on_websocket_port() {
    let gw = start_gateway().await;
    let response = raw_http(gw.addr, "GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains(r#""status":"healthy""#));
}

#[tokio::test]
async fn test_upgrade_split_across_writes_is_accepted() {
    let gw = start_gateway().await;
    let mut stream = TcpStream::connect(gw.addr).await.unwrap();

    stream
        .write_all(b"GET /WebChat HTTP/1.1\r\nHost: localhost\r\n")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    stream
        .write_all(
            b"Upgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .await
        .unwrap();

    let mut buf = vec![0u8; 1024];
    let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("No handshake response")
        .unwrap();
    let response = String::from_utf8_lossy(&buf[..n]);
    assert!(
        response.starts_with("HTTP/1.1 101"),
        "Expected upgrade, got: {}",
        response
    );
    let registry = gw.gateway.registry().clone();
    wait_until(|| registry.connected_count() == 1).await;
}

#[tokio::test]
async fn test_idle_socket_released_after_handshake_timeout() {
    let gw = start_gateway_with(GatewayConfig {
        handshake_timeout_secs: 1,
        max_connections: 1,
        ..test_config()
    })
    .await;

    // Connects and never sends a byte.
    let mut idle = TcpStream::connect(gw.addr).await.unwrap();
    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(3), idle.read(&mut buf))
        .await
        .expect("Idle socket still open after the handshake timeout");
    assert!(matches!(read, Ok(0) | Err(_)));

    // The only connection slot is free again.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let (_ws, session_id) = connect_client(&gw).await;
    assert!(gw.gateway.registry().contains(&session_id));
}

#[tokio::test]
async fn test_upgrade_on_wrong_path_is_refused() {
    let gw = start_gateway().await;
    let url = format!("ws://{}/elsewhere", gw.addr);
    assert!(connect_async(url).await.is_err());
    assert_eq!(gw.gateway.registry().connected_count(), 0);
}
