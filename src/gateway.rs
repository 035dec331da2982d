// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Gateway Lifecycle
//!
//! Owns the WebSocket listener and the shared state every connection task
//! works against. The lifecycle is `Uninitialized -> Listening ->
//! Uninitialized`: [`Gateway::load`] binds, [`Gateway::unload`] closes every
//! client and releases the port. A listener that dies on its own also
//! returns the gateway to `Uninitialized`.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::authenticator::Authenticator;
use crate::config::GatewayConfig;
use crate::connection_registry::{ConnectionRegistry, RegistryMessage};
use crate::delivery::Delivery;
use crate::error::GatewayError;
use crate::handler;
use crate::host::{Host, HostApi, HostBinding};
use crate::metrics::GatewayMetrics;
use crate::protocol::{self, OutboundEnvelope};
use crate::router::ApiRouter;

/// Close reason sent to clients on a deliberate shutdown.
pub const SHUTDOWN_REASON: &str = "Server shutting down";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Uninitialized,
    Listening(SocketAddr),
}

/// State shared by the listener, every connection task and the host API.
pub struct GatewayCore {
    pub(crate) config: GatewayConfig,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) authenticator: Authenticator,
    pub(crate) delivery: Delivery,
    pub(crate) router: ApiRouter,
    pub(crate) host: HostBinding,
    pub(crate) metrics: GatewayMetrics,
}

impl GatewayCore {
    fn new(config: GatewayConfig, metrics: GatewayMetrics) -> Self {
        let registry = Arc::new(ConnectionRegistry::with_send_buffer(config.send_buffer));
        let delivery = Delivery::new(registry.clone(), metrics.clone());
        GatewayCore {
            authenticator: Authenticator::new(config.access_token.clone()),
            router: ApiRouter::new(registry.clone(), delivery.clone()),
            host: HostBinding::new(&config.bot_nickname),
            registry,
            delivery,
            metrics,
            config,
        }
    }

    /// Removes every session, sends each a shutdown notice and a close
    /// request. Sessions whose queue cannot take the close are killed.
    /// The registry stays closed until the next [`Gateway::load`].
    fn close_all_sessions(&self, reason: &str) -> usize {
        let operator = self.host.identity().self_id;
        let sessions = self.registry.drain();
        let count = sessions.len();

        for (session, sender, kill) in sessions {
            let notice = protocol::encode(&OutboundEnvelope::notice(
                "server_shutdown",
                &protocol::new_message_id(),
                operator.clone(),
            ));
            let queued = sender.try_send(RegistryMessage::Frame(notice)).is_ok()
                && sender
                    .try_send(RegistryMessage::Close {
                        reason: reason.to_string(),
                    })
                    .is_ok();
            if !queued {
                warn!("[{}] Could not queue close, dropping socket", session.id);
                kill.notify_one();
            }
        }
        count
    }
}

struct ListenerHandle {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

/// The gateway service. Cheap to clone; clones share one listener.
#[derive(Clone)]
pub struct Gateway {
    core: Arc<GatewayCore>,
    listener: Arc<Mutex<Option<ListenerHandle>>>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self::with_metrics(config, GatewayMetrics::new())
    }

    pub fn with_metrics(config: GatewayConfig, metrics: GatewayMetrics) -> Self {
        Gateway {
            core: Arc::new(GatewayCore::new(config, metrics)),
            listener: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.core.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.core.registry
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.core.metrics
    }

    pub async fn state(&self) -> GatewayState {
        match self.listener.lock().await.as_ref() {
            Some(handle) if !handle.task.is_finished() => GatewayState::Listening(handle.addr),
            _ => GatewayState::Uninitialized,
        }
    }

    /// Address the listener is bound to, if listening.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match self.state().await {
            GatewayState::Listening(addr) => Some(addr),
            GatewayState::Uninitialized => None,
        }
    }

    /// Starts listening if not already. Returns the bound address.
    ///
    /// A bind failure leaves the gateway `Uninitialized`.
    pub async fn load(&self) -> Result<SocketAddr, GatewayError> {
        let mut slot = self.listener.lock().await;
        if let Some(handle) = slot.as_ref() {
            if !handle.task.is_finished() {
                return Ok(handle.addr);
            }
        }
        *slot = None;

        let bind_addr = self.core.config.listen_addr;
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| GatewayError::Bind {
                addr: bind_addr,
                source,
            })?;
        let addr = listener.local_addr().map_err(GatewayError::LocalAddr)?;

        self.core.registry.reopen();
        let task = tokio::spawn(accept_loop(
            self.core.clone(),
            listener,
            self.listener.clone(),
            addr,
        ));
        *slot = Some(ListenerHandle { addr, task });

        info!(
            "WebSocket server listening on {}",
            self.core.config.ws_url(addr)
        );
        Ok(addr)
    }

    /// Binds `host` as the event sink and makes sure the listener is up.
    pub async fn connect(&self, host: Arc<dyn Host>) -> Result<HostApi, GatewayError> {
        let identity = self.core.host.bind(host);
        info!(
            "Host connected: self_id={:?}, nickname={}",
            identity.self_id, identity.nickname
        );
        self.load().await?;
        Ok(self.host_api())
    }

    pub(crate) fn core(&self) -> Arc<GatewayCore> {
        self.core.clone()
    }

    pub fn host_api(&self) -> HostApi {
        HostApi::new(self.core.clone())
    }

    /// Closes every client and releases the listener.
    pub async fn unload(&self) {
        let mut slot = self.listener.lock().await;
        let closed = self.core.close_all_sessions(SHUTDOWN_REASON);
        if let Some(handle) = slot.take() {
            handle.task.abort();
            let _ = handle.task.await;
            info!(
                "WebSocket server on {} stopped, closed {} clients",
                handle.addr, closed
            );
        }
    }
}

async fn accept_loop(
    core: Arc<GatewayCore>,
    listener: TcpListener,
    slot: Arc<Mutex<Option<ListenerHandle>>>,
    addr: SocketAddr,
) {
    let limiter = Arc::new(Semaphore::new(core.config.max_connections));

    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("WebSocket listener on {} failed: {}", addr, e);
                break;
            }
        };

        // Enforce connection limit
        let permit = match limiter.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    "Connection from {} rejected: at max capacity ({})",
                    remote_addr, core.config.max_connections
                );
                core.metrics.connection_errors.inc();
                drop(stream);
                continue;
            }
        };

        let core = core.clone();
        tokio::spawn(async move {
            // Keep the permit alive for the duration of the connection
            let _permit = permit;
            handler::serve_socket(stream, remote_addr, core).await;
        });
    }

    // The listener is gone: release every client.
    {
        let mut slot = slot.lock().await;
        if slot.as_ref().is_some_and(|h| h.addr == addr) {
            *slot = None;
        }
    }
    let closed = core.close_all_sessions("Server error");
    warn!("Gateway returned to uninitialized, closed {} clients", closed);
}
