// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! WebChat Gateway Server
//!
//! Standalone gateway process. Provides:
//! - WebSocket endpoint for browser chat clients
//! - HTTP endpoints for health checks and Prometheus metrics
//!
//! Without an embedding bot framework, client messages are logged and
//! acknowledged but not answered.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use webchat_gateway::http::{create_router, HttpState};
use webchat_gateway::{Gateway, GatewayConfig, Host, HostIdentity, MessageEvent};

/// Host that only logs what clients send.
struct LoggingHost {
    nickname: String,
}

impl Host for LoggingHost {
    fn publish_event(&self, event_name: &str, event: MessageEvent) {
        info!(
            "[{}] {} from {} ({}): {}",
            event.source_session_id,
            event_name,
            event.sender.nickname,
            event.user_id,
            event.raw_message
        );
    }

    fn resolve_identity(&self) -> HostIdentity {
        HostIdentity {
            self_id: Some("webchat_bot".to_string()),
            nickname: self.nickname.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("webchat_gateway=info".parse()?),
        )
        .init();

    let config = GatewayConfig::from_env();

    info!(
        "Starting WebChat Gateway v{}",
        env!("CARGO_PKG_VERSION")
    );
    info!("WebSocket: {}", config.ws_url(config.listen_addr));
    info!("Metrics endpoint: {}", config.metrics_addr);
    info!("Max connections: {}", config.max_connections);
    if !GatewayConfig::access_token_from(|key| std::env::var(key).ok()) {
        warn!("WEBCHAT_ACCESS_TOKEN not set, generated one for this run");
        warn!("Access token: {}", config.access_token);
    }
    if config.disconnect_on_auth_failure {
        info!("Clients are disconnected after a failed auth");
    }

    // Check for metrics auth token (optional additional protection)
    if config.metrics_token.is_some() {
        info!("Metrics endpoint protected with bearer token");
    } else if !config.metrics_addr.ip().is_loopback() {
        warn!("Metrics exposed on non-localhost without auth token");
        warn!("Consider setting WEBCHAT_METRICS_TOKEN for production use");
    }

    let gateway = Gateway::new(config.clone());

    // Start HTTP server for health/metrics
    let http_state = HttpState {
        metrics: gateway.metrics().clone(),
        registry: gateway.registry().clone(),
        metrics_token: config.metrics_token.clone(),
    };
    let http_router = create_router(http_state);
    let http_listener = TcpListener::bind(config.metrics_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {}", config.metrics_addr))?;
    let http_addr = config.metrics_addr;
    tokio::spawn(async move {
        info!("HTTP server listening on {}", http_addr);
        if let Err(e) = axum::serve(http_listener, http_router).await {
            error!("HTTP server failed: {}", e);
        }
    });

    let host = Arc::new(LoggingHost {
        nickname: config.bot_nickname.clone(),
    });
    if let Err(e) = gateway.connect(host).await {
        error!("{}", e);
        std::process::exit(1);
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutting down");
    gateway.unload().await;

    Ok(())
}
