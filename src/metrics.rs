// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Prometheus Metrics for the Gateway Bridge

use prometheus::{IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Bridge metrics.
#[derive(Clone)]
pub struct BridgeMetrics {
    /// Registry for all metrics.
    pub registry: Arc<Registry>,

    // Connection metrics
    /// Total gateway connections accepted.
    pub connections_total: IntCounter,
    /// Current open gateway connections.
    pub connections_active: IntGauge,
    /// Connections dropped at the connection cap.
    pub connections_rejected: IntCounter,
    /// Handshakes that produced a session key.
    pub handshakes_completed: IntCounter,
    /// Connections closed for handshake/authorization timeouts.
    pub timeouts: IntCounter,

    // Authorization
    pub auth_accepted: IntCounter,
    pub auth_rejected: IntCounter,

    // Protocol
    /// Connections closed for malformed input.
    pub protocol_errors: IntCounter,
    /// Envelopes received from authenticated gateways.
    pub messages_received: IntCounter,
    /// Envelopes written to gateways.
    pub messages_sent: IntCounter,

    /// Owners with at least one live gateway.
    pub owners_online: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let metric = IntCounter::with_opts(Opts::new(name, help)).expect("valid metric opts");
    registry
        .register(Box::new(metric.clone()))
        .expect("metric registered once");
    metric
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let metric = IntGauge::with_opts(Opts::new(name, help)).expect("valid metric opts");
    registry
        .register(Box::new(metric.clone()))
        .expect("metric registered once");
    metric
}

impl BridgeMetrics {
    /// Creates a new metrics instance with all counters registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        BridgeMetrics {
            connections_total: counter(
                &registry,
                "bridge_connections_total",
                "Total gateway connections accepted",
            ),
            connections_active: gauge(
                &registry,
                "bridge_connections_active",
                "Current open gateway connections",
            ),
            connections_rejected: counter(
                &registry,
                "bridge_connections_rejected_total",
                "Connections dropped at capacity",
            ),
            handshakes_completed: counter(
                &registry,
                "bridge_handshakes_completed_total",
                "Completed key exchanges",
            ),
            timeouts: counter(
                &registry,
                "bridge_timeouts_total",
                "Connections closed by handshake, authorization or idle timeout",
            ),
            auth_accepted: counter(
                &registry,
                "bridge_auth_accepted_total",
                "Gateway tokens accepted",
            ),
            auth_rejected: counter(
                &registry,
                "bridge_auth_rejected_total",
                "Gateway tokens rejected",
            ),
            protocol_errors: counter(
                &registry,
                "bridge_protocol_errors_total",
                "Connections closed for protocol violations",
            ),
            messages_received: counter(
                &registry,
                "bridge_messages_received_total",
                "Envelopes received from gateways",
            ),
            messages_sent: counter(
                &registry,
                "bridge_messages_sent_total",
                "Envelopes sent to gateways",
            ),
            owners_online: gauge(
                &registry,
                "bridge_owners_online",
                "Owners with at least one live gateway",
            ),
            registry: Arc::new(registry),
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}
