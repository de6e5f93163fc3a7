// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Bridge Configuration
//!
//! Configuration loaded from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use crate::frame_codec::DEFAULT_MAX_FRAME_SIZE;
use crate::session_cipher::IvChaining;

/// Subscriptions issued to every gateway after authorization.
pub const DEFAULT_SUBSCRIPTIONS: [&str; 4] = ["fd/+/list", "fd/+/exposes", "fd/+/status", "fd/#"];

/// Bridge daemon configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Address gateways connect to.
    pub listen_addr: SocketAddr,
    /// Address for the health/metrics HTTP endpoint.
    pub metrics_addr: SocketAddr,
    /// Optional bearer token protecting `/metrics`.
    pub metrics_token: Option<String>,
    /// Maximum concurrent gateway connections.
    pub max_connections: usize,
    /// Maximum escaped size of a single frame in bytes.
    pub max_frame_size: usize,
    /// Seconds a peer has to send the 12-byte handshake.
    pub handshake_timeout_secs: u64,
    /// Seconds from handshake completion until the connection must be
    /// authenticated.
    pub auth_timeout_secs: u64,
    /// Seconds an authenticated connection may stay silent.
    pub idle_timeout_secs: u64,
    /// IV chaining mode for session ciphers.
    pub iv_chaining: IvChaining,
    /// Fixed responder scalar. Random per connection when unset.
    pub dh_secret: Option<u32>,
    /// Topics subscribed on behalf of every authorized gateway.
    pub default_subscriptions: Vec<String>,
    /// Static `token=owner` table for the built-in validator.
    pub tokens: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8883)),
            metrics_addr: SocketAddr::from(([127, 0, 0, 1], 8081)),
            metrics_token: None,
            max_connections: 1000,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            handshake_timeout_secs: 10,
            auth_timeout_secs: 15,
            idle_timeout_secs: 300, // 5 minutes
            iv_chaining: IvChaining::Shared,
            dh_secret: None,
            default_subscriptions: DEFAULT_SUBSCRIPTIONS.iter().map(|s| s.to_string()).collect(),
            tokens: String::new(),
        }
    }
}

impl BridgeConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from an arbitrary key lookup. Unparsable values
    /// keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(parsed) = lookup("BRIDGE_LISTEN_ADDR").and_then(|v| v.parse().ok()) {
            config.listen_addr = parsed;
        }
        if let Some(parsed) = lookup("BRIDGE_METRICS_ADDR").and_then(|v| v.parse().ok()) {
            config.metrics_addr = parsed;
        }
        if let Some(token) = lookup("BRIDGE_METRICS_TOKEN").filter(|t| !t.is_empty()) {
            config.metrics_token = Some(token);
        }
        if let Some(parsed) = lookup("BRIDGE_MAX_CONNECTIONS").and_then(|v| v.parse().ok()) {
            config.max_connections = parsed;
        }
        if let Some(parsed) = lookup("BRIDGE_MAX_FRAME_SIZE").and_then(|v| v.parse().ok()) {
            config.max_frame_size = parsed;
        }
        if let Some(parsed) = lookup("BRIDGE_HANDSHAKE_TIMEOUT").and_then(|v| v.parse().ok()) {
            config.handshake_timeout_secs = parsed;
        }
        if let Some(parsed) = lookup("BRIDGE_AUTH_TIMEOUT").and_then(|v| v.parse().ok()) {
            config.auth_timeout_secs = parsed;
        }
        if let Some(parsed) = lookup("BRIDGE_IDLE_TIMEOUT").and_then(|v| v.parse().ok()) {
            config.idle_timeout_secs = parsed;
        }
        if let Some(parsed) = lookup("BRIDGE_IV_CHAINING").and_then(|v| v.parse().ok()) {
            config.iv_chaining = parsed;
        }
        if let Some(parsed) = lookup("BRIDGE_DH_SECRET").and_then(|v| v.parse().ok()) {
            config.dh_secret = Some(parsed);
        }
        if let Some(val) = lookup("BRIDGE_SUBSCRIPTIONS") {
            config.default_subscriptions = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(val) = lookup("BRIDGE_TOKENS") {
            config.tokens = val;
        }

        config
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}
