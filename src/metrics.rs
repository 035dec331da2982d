//! Prometheus Metrics for the WebChat Gateway
//!
//! Provides observability metrics for monitoring the gateway.

use prometheus::{IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Gateway metrics.
#[derive(Clone)]
pub struct GatewayMetrics {
    /// Registry for all metrics.
    pub registry: Arc<Registry>,

    // Connection metrics
    /// Total WebSocket connections accepted.
    pub connections_total: IntCounter,
    /// Current active WebSocket connections.
    pub connections_active: IntGauge,
    /// Connection errors (handshake failures, capacity rejections).
    pub connection_errors: IntCounter,

    // Frame metrics
    /// Total inbound frames received.
    pub frames_received: IntCounter,
    /// Inbound frames rejected (oversized, malformed, unauthenticated, invalid).
    pub frames_rejected: IntCounter,
    /// Failed authentication attempts.
    pub auth_failures: IntCounter,

    // Host metrics
    /// Message events published to the host.
    pub events_published: IntCounter,
    /// API calls dispatched.
    pub api_calls: IntCounter,

    // Delivery metrics
    /// Messages queued to a client.
    pub messages_delivered: IntCounter,
    /// Deliveries that failed.
    pub delivery_failures: IntCounter,
    /// Sessions evicted because their socket was broken.
    pub sessions_evicted: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::with_opts(Opts::new(name, help))
        .unwrap_or_else(|e| panic!("invalid metric definition {}: {}", name, e));
    if let Err(e) = registry.register(Box::new(counter.clone())) {
        tracing::warn!("Failed to register metric {}: {}", name, e);
    }
    counter
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::with_opts(Opts::new(name, help))
        .unwrap_or_else(|e| panic!("invalid metric definition {}: {}", name, e));
    if let Err(e) = registry.register(Box::new(gauge.clone())) {
        tracing::warn!("Failed to register metric {}: {}", name, e);
    }
    gauge
}

impl GatewayMetrics {
    /// Creates a new metrics instance with all counters registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_total = counter(
            &registry,
            "webchat_connections_total",
            "Total WebSocket connections accepted",
        );
        let connections_active = gauge(
            &registry,
            "webchat_connections_active",
            "Current active WebSocket connections",
        );
        let connection_errors = counter(
            &registry,
            "webchat_connection_errors_total",
            "Total connection errors",
        );

        let frames_received = counter(
            &registry,
            "webchat_frames_received_total",
            "Total inbound frames received",
        );
        let frames_rejected = counter(
            &registry,
            "webchat_frames_rejected_total",
            "Total inbound frames rejected",
        );
        let auth_failures = counter(
            &registry,
            "webchat_auth_failures_total",
            "Total failed authentication attempts",
        );

        let events_published = counter(
            &registry,
            "webchat_events_published_total",
            "Total message events published to the host",
        );
        let api_calls = counter(
            &registry,
            "webchat_api_calls_total",
            "Total API calls dispatched",
        );

        let messages_delivered = counter(
            &registry,
            "webchat_messages_delivered_total",
            "Total messages queued to clients",
        );
        let delivery_failures = counter(
            &registry,
            "webchat_delivery_failures_total",
            "Total failed deliveries",
        );
        let sessions_evicted = counter(
            &registry,
            "webchat_sessions_evicted_total",
            "Total sessions evicted after a broken write",
        );

        GatewayMetrics {
            registry: Arc::new(registry),
            connections_total,
            connections_active,
            connection_errors,
            frames_received,
            frames_rejected,
            auth_failures,
            events_published,
            api_calls,
            messages_delivered,
            delivery_failures,
            sessions_evicted,
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_registered_metrics() {
        let metrics = GatewayMetrics::new();
        metrics.connections_total.inc();
        metrics.sessions_evicted.inc_by(2);

        let text = metrics.encode();
        assert!(text.contains("webchat_connections_total 1"));
        assert!(text.contains("webchat_sessions_evicted_total 2"));
        assert!(text.contains("webchat_connections_active 0"));
    }
}
