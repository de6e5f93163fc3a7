// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Gateway Bridge Daemon
//!
//! Terminates encrypted TCP connections from home-automation gateways.
//! Provides:
//! - Key exchange, framing and session encryption for the gateway protocol
//! - Token authorization and per-owner connection tracking
//! - A device cache fed by gateway publications
//! - HTTP endpoints for health checks and Prometheus metrics

use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use gateway_bridge::config::BridgeConfig;
use gateway_bridge::connection_registry::{ConnectionRegistry, OwnerEvent};
use gateway_bridge::handler::{ConnectionDeps, ConnectionSettings};
use gateway_bridge::http::{create_router, HttpState};
use gateway_bridge::metrics::BridgeMetrics;
use gateway_bridge::server;
use gateway_bridge::validator::StaticTokenValidator;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gateway_bridge=info".parse().unwrap()),
        )
        .init();

    let config = BridgeConfig::from_env();

    info!("Starting Gateway Bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("Gateway listener: {}", config.listen_addr);
    info!("Metrics endpoint: {}", config.metrics_addr);
    info!("IV chaining: {:?}", config.iv_chaining);
    info!(
        "Timeouts: handshake {}s, auth {}s, idle {}s",
        config.handshake_timeout_secs, config.auth_timeout_secs, config.idle_timeout_secs
    );
    if config.dh_secret.is_some() {
        warn!("Using a fixed key exchange secret (BRIDGE_DH_SECRET)");
    }

    let validator = StaticTokenValidator::parse(&config.tokens);
    if validator.is_empty() {
        warn!("No gateway tokens configured; every authorization will be refused");
    } else {
        info!("Loaded {} gateway tokens", validator.len());
    }

    let metrics = BridgeMetrics::new();
    let registry = Arc::new(ConnectionRegistry::new(
        Arc::new(validator),
        config.default_subscriptions.clone(),
    ));

    if config.metrics_token.is_some() {
        info!("Metrics endpoint protected with bearer token");
    } else if !config.metrics_addr.ip().is_loopback() {
        warn!("Metrics exposed on non-localhost without auth token");
        warn!("Consider setting BRIDGE_METRICS_TOKEN for production use");
    }

    // Start HTTP server for health/metrics
    let http_state = HttpState {
        metrics: metrics.clone(),
        registry: registry.clone(),
        metrics_token: config.metrics_token.clone(),
        started_at: Instant::now(),
    };
    let http_router = create_router(http_state);
    let http_listener = TcpListener::bind(config.metrics_addr)
        .await
        .expect("Failed to bind HTTP listener");
    let http_addr = config.metrics_addr;
    tokio::spawn(async move {
        info!("HTTP server listening on {}", http_addr);
        if let Err(e) = axum::serve(http_listener, http_router).await {
            warn!("HTTP server stopped: {}", e);
        }
    });

    // Log owner presence and device updates
    let mut events = registry.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(OwnerEvent::OwnerOnline { owner_id }) => debug!("Owner {} online", owner_id),
                Ok(OwnerEvent::OwnerOffline { owner_id }) => debug!("Owner {} offline", owner_id),
                Ok(event) => debug!("Owner event: {:?}", event),
                Err(RecvError::Lagged(skipped)) => warn!("Owner event log lagged by {}", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .expect("Failed to bind gateway listener");
    info!("Gateway server listening on {}", config.listen_addr);

    let deps = ConnectionDeps {
        registry,
        metrics,
        settings: ConnectionSettings::from(&config),
    };
    server::serve(listener, deps, config.max_connections).await;
}
