// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod config;
pub mod connection;
pub mod connection_registry;
pub mod envelope;
pub mod frame_codec;
pub mod handler;
pub mod http;
pub mod key_exchange;
pub mod metrics;
pub mod server;
pub mod session_cipher;
pub mod validator;

use std::sync::Arc;

use tokio::net::TcpListener;

use config::BridgeConfig;
use connection_registry::ConnectionRegistry;
use handler::{ConnectionDeps, ConnectionSettings};
use metrics::BridgeMetrics;
use validator::TokenValidator;

/// Test helper to start a bridge on an ephemeral port. Returns the bound
/// listener address and the shared registry.
pub async fn test_start(
    config: BridgeConfig,
    validator: Arc<dyn TokenValidator>,
) -> (std::net::SocketAddr, Arc<ConnectionRegistry>, BridgeMetrics) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let addr = listener.local_addr().expect("listener has an address");

    let registry = Arc::new(ConnectionRegistry::new(
        validator,
        config.default_subscriptions.clone(),
    ));
    let metrics = BridgeMetrics::new();
    let deps = ConnectionDeps {
        registry: registry.clone(),
        metrics: metrics.clone(),
        settings: ConnectionSettings::from(&config),
    };
    tokio::spawn(server::serve(listener, deps, config.max_connections));

    (addr, registry, metrics)
}
