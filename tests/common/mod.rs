// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Common test utilities for bridge integration tests.
//!
//! [`GatewayClient`] plays the gateway side of the wire protocol.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use gateway_bridge::config::BridgeConfig;
use gateway_bridge::frame_codec::FrameCodec;
use gateway_bridge::key_exchange::{mod_pow, HandshakeParams};
use gateway_bridge::session_cipher::{IvChaining, SessionCipher};
use gateway_bridge::validator::{StaticTokenValidator, TokenValidator, ValidationError};

pub const PRIME: u32 = 0xFFFF_FFFB;
pub const GENERATOR: u32 = 2;

/// How long a test waits for a single reply.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Config for an ephemeral test bridge with a single default subscription.
#[allow(dead_code)]
pub fn test_config() -> BridgeConfig {
    BridgeConfig {
        default_subscriptions: vec!["fd/#".to_string()],
        ..BridgeConfig::default()
    }
}

/// Validator accepting `abc` for `u1` and `xyz` for `u2`, counting calls.
#[derive(Default)]
pub struct CountingValidator {
    inner: StaticTokenValidator,
    calls: AtomicUsize,
}

#[allow(dead_code)]
impl CountingValidator {
    pub fn new() -> Arc<Self> {
        Arc::new(CountingValidator {
            inner: StaticTokenValidator::new()
                .with_token("abc", "u1")
                .with_token("xyz", "u2"),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenValidator for CountingValidator {
    async fn validate(&self, token: &str) -> Result<String, ValidationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.validate(token).await
    }
}

/// Gateway side of one bridge connection.
pub struct GatewayClient {
    stream: TcpStream,
    cipher: SessionCipher,
    codec: FrameCodec,
    inbox: VecDeque<Value>,
    pub server_public: u32,
}

#[allow(dead_code)]
impl GatewayClient {
    /// Connects and completes the key exchange with a fixed client secret.
    pub async fn connect(addr: SocketAddr) -> Self {
        Self::connect_with_secret(addr, 4242).await
    }

    pub async fn connect_with_secret(addr: SocketAddr, client_secret: u32) -> Self {
        let mut stream = TcpStream::connect(addr).await.expect("connect to bridge");
        let params = HandshakeParams {
            prime: PRIME,
            generator: GENERATOR,
            client_public: mod_pow(GENERATOR, client_secret, PRIME),
        };
        stream
            .write_all(&params.to_bytes())
            .await
            .expect("send handshake");

        let mut reply = [0u8; 4];
        tokio::time::timeout(REPLY_TIMEOUT, stream.read_exact(&mut reply))
            .await
            .expect("handshake reply in time")
            .expect("read handshake reply");
        let server_public = u32::from_be_bytes(reply);
        let shared = mod_pow(server_public, client_secret, PRIME);
        Self::from_stream(stream, shared, server_public)
    }

    /// Wraps a socket whose handshake already completed with `shared_secret`.
    pub fn from_stream(stream: TcpStream, shared_secret: u32, server_public: u32) -> Self {
        GatewayClient {
            stream,
            cipher: SessionCipher::new(shared_secret.to_be_bytes(), IvChaining::Shared),
            codec: FrameCodec::default(),
            inbox: VecDeque::new(),
            server_public,
        }
    }

    /// Encrypts, frames and sends one JSON value.
    pub async fn send_json(&mut self, value: &Value) {
        let json = serde_json::to_vec(value).expect("serialize");
        let wire = FrameCodec::frame(&self.cipher.encrypt(&json));
        self.stream.write_all(&wire).await.expect("send frame");
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("send raw bytes");
    }

    pub async fn authorize(&mut self, unique_id: &str, token: &str) {
        self.send_json(&json!({"uniqueId": unique_id, "token": token}))
            .await;
    }

    pub async fn publish(&mut self, topic: &str, message: Value) {
        self.send_json(&json!({"action": "publish", "topic": topic, "message": message}))
            .await;
    }

    /// Next decrypted envelope, or `None` once the bridge closed the socket
    /// or nothing arrived in time.
    pub async fn recv(&mut self) -> Option<Value> {
        let mut buf = [0u8; 1024];
        loop {
            if let Some(value) = self.inbox.pop_front() {
                return Some(value);
            }
            let n = match tokio::time::timeout(REPLY_TIMEOUT, self.stream.read(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => n,
                _ => return None,
            };
            for frame in self.codec.feed(&buf[..n]).expect("well-formed frames") {
                let plaintext = self.cipher.decrypt(&frame).expect("aligned ciphertext");
                let value = serde_json::from_slice(&plaintext).expect("JSON envelope");
                self.inbox.push_back(value);
            }
        }
    }

    /// True once the bridge has closed the connection.
    pub async fn is_closed_by_server(&mut self) -> bool {
        let mut buf = [0u8; 256];
        loop {
            match tokio::time::timeout(REPLY_TIMEOUT, self.stream.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => continue,
                Err(_) => return false,
            }
        }
    }
}

/// Polls `condition` until it holds or two seconds pass.
#[allow(dead_code)]
pub async fn wait_until<F>(condition: F) -> bool
where
    F: Fn() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
