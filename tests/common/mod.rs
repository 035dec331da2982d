// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Common test utilities for gateway integration tests.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use webchat_gateway::{Gateway, GatewayConfig, Host, HostApi, HostIdentity, MessageEvent};

pub const TEST_TOKEN: &str = "test-token";

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Host that records every published event.
#[derive(Default)]
pub struct RecordingHost {
    pub events: Mutex<Vec<(String, MessageEvent)>>,
}

impl RecordingHost {
    #[allow(dead_code)]
    pub fn events(&self) -> Vec<(String, MessageEvent)> {
        self.events.lock().unwrap().clone()
    }
}

impl Host for RecordingHost {
    fn publish_event(&self, event_name: &str, event: MessageEvent) {
        self.events
            .lock()
            .unwrap()
            .push((event_name.to_string(), event));
    }

    fn resolve_identity(&self) -> HostIdentity {
        HostIdentity {
            self_id: Some("bot".to_string()),
            nickname: "Test Bot".to_string(),
        }
    }
}

pub struct TestGateway {
    pub gateway: Gateway,
    pub api: HostApi,
    pub host: Arc<RecordingHost>,
    pub addr: SocketAddr,
}

impl TestGateway {
    #[allow(dead_code)]
    pub fn url(&self) -> String {
        format!("ws://{}/WebChat", self.addr)
    }
}

/// Test config bound to an ephemeral localhost port.
pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        access_token: TEST_TOKEN.to_string(),
        ..GatewayConfig::default()
    }
}

/// Starts a gateway with a recording host attached.
#[allow(dead_code)]
pub async fn start_gateway() -> TestGateway {
    start_gateway_with(test_config()).await
}

pub async fn start_gateway_with(config: GatewayConfig) -> TestGateway {
    let gateway = Gateway::new(config);
    let host = Arc::new(RecordingHost::default());
    let api = gateway
        .connect(host.clone())
        .await
        .expect("Failed to start gateway");
    let addr = gateway.local_addr().await.expect("Gateway not listening");
    TestGateway {
        gateway,
        api,
        host,
        addr,
    }
}

/// Connects a client and consumes the `connected` frame. Returns the
/// client and its session id.
#[allow(dead_code)]
pub async fn connect_client(gw: &TestGateway) -> (Client, String) {
    let (mut ws, _) = connect_async(gw.url()).await.expect("Failed to connect");
    let connected = recv_json(&mut ws).await;
    assert_eq!(connected["type"], "connected");
    let session_id = connected["payload"]["clientId"]
        .as_str()
        .expect("connected frame without clientId")
        .to_string();
    (ws, session_id)
}

/// Connects and authenticates a client as `user_id`.
#[allow(dead_code)]
pub async fn connect_authed(gw: &TestGateway, user_id: &str) -> (Client, String) {
    let (mut ws, session_id) = connect_client(gw).await;
    send_json(
        &mut ws,
        &serde_json::json!({
            "type": "auth",
            "payload": {"token": TEST_TOKEN, "user_id": user_id, "nickname": user_id}
        }),
    )
    .await;
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "auth_response");
    assert_eq!(reply["payload"]["status"], "ok");
    (ws, session_id)
}

#[allow(dead_code)]
pub async fn send_json(ws: &mut Client, value: &Value) {
    ws.send(Message::Text(value.to_string()))
        .await
        .expect("Failed to send frame");
}

/// Receives the next text frame as JSON, failing after 2 seconds.
#[allow(dead_code)]
pub async fn recv_json(ws: &mut Client) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("Timed out waiting for frame")
            .expect("Stream ended")
            .expect("Read error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).expect("Invalid JSON"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("Expected text frame, got {:?}", other),
        }
    }
}

/// Asserts that nothing arrives within a short window.
#[allow(dead_code)]
pub async fn assert_silent(ws: &mut Client) {
    if let Ok(Some(Ok(Message::Text(text)))) =
        timeout(Duration::from_millis(200), ws.next()).await
    {
        panic!("Unexpected frame: {}", text);
    }
}

/// Polls until `check` holds, failing after 2 seconds.
#[allow(dead_code)]
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Condition not met in time");
}
