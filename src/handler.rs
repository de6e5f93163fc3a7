// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Gateway Connection Handler
//!
//! Drives one gateway socket: reads bytes into the [`ClientConnection`]
//! state machine, writes its replies, consults the registry for
//! authorization and forwards decrypted envelopes.
//!
//! All processing for a connection happens on a single task, so the session
//! cipher never sees concurrent or reordered calls. The read loop is paused
//! while the validator runs; bytes that arrive meanwhile stay buffered.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::connection::{ClientConnection, ConnectionError, ConnectionEvent, ConnectionState};
use crate::connection_registry::{ConnectionId, ConnectionRegistry, RegistryError};
use crate::envelope::Envelope;
use crate::key_exchange::{KeyExchange, KeyExchangeError};
use crate::metrics::BridgeMetrics;
use crate::session_cipher::IvChaining;

const READ_BUFFER_SIZE: usize = 4096;

/// Stand-in deadline for timeouts too large to add to the current instant.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

/// Per-connection protocol settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub handshake_timeout: Duration,
    pub auth_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_frame_size: usize,
    pub iv_chaining: IvChaining,
    pub dh_secret: Option<u32>,
}

impl From<&BridgeConfig> for ConnectionSettings {
    fn from(config: &BridgeConfig) -> Self {
        ConnectionSettings {
            handshake_timeout: config.handshake_timeout(),
            auth_timeout: config.auth_timeout(),
            idle_timeout: config.idle_timeout(),
            max_frame_size: config.max_frame_size,
            iv_chaining: config.iv_chaining,
            dh_secret: config.dh_secret,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings::from(&BridgeConfig::default())
    }
}

/// Shared dependencies for handling a gateway connection.
#[derive(Clone)]
pub struct ConnectionDeps {
    pub registry: Arc<ConnectionRegistry>,
    pub metrics: BridgeMetrics,
    pub settings: ConnectionSettings,
}

/// Why a connection ended.
#[derive(Debug)]
pub enum CloseReason {
    /// The peer closed the socket cleanly.
    PeerClosed,
    /// A handshake, authorization or idle deadline expired in this state.
    Timeout(ConnectionState),
    /// The peer violated the wire protocol.
    Protocol(ConnectionError),
    /// The token was not accepted.
    Unauthorized(RegistryError),
    /// Socket read or write failed.
    Transport(std::io::Error),
}

/// Handles a gateway connection until it closes, then releases all registry
/// state for it.
pub async fn handle_connection<S>(
    stream: S,
    peer_addr: Option<SocketAddr>,
    deps: ConnectionDeps,
) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ConnectionDeps {
        registry,
        metrics,
        settings,
    } = deps;
    // Random session label for logging; owner and device ids stay at debug.
    let session = uuid::Uuid::new_v4().to_string()[..8].to_string();

    let (id, outbound) = registry.accept(peer_addr);
    metrics.connections_total.inc();
    metrics.connections_active.inc();
    let registration = RegistrationGuard {
        id,
        registry: registry.clone(),
        metrics: metrics.clone(),
    };
    debug!("[{}] Gateway connected as connection {}", session, id);

    let key_exchange = settings
        .dh_secret
        .map_or_else(KeyExchange::random, KeyExchange::with_secret);
    let mut conn =
        ClientConnection::new(key_exchange, settings.iv_chaining, settings.max_frame_size);

    let mut session_ctx = Session {
        id,
        label: &session,
        conn: &mut conn,
        registry: &registry,
        metrics: &metrics,
        settings: &settings,
    };
    let reason = session_ctx.run(stream, outbound).await;

    conn.close();
    drop(registration);

    match &reason {
        CloseReason::PeerClosed => debug!("[{}] Disconnected", session),
        CloseReason::Timeout(state) => {
            metrics.timeouts.inc();
            warn!("[{}] Timed out in state {:?}", session, state);
        }
        CloseReason::Protocol(e) => {
            metrics.protocol_errors.inc();
            warn!("[{}] Protocol error: {}", session, e);
        }
        CloseReason::Unauthorized(e) => {
            metrics.auth_rejected.inc();
            info!("[{}] Authorization refused: {}", session, e);
        }
        CloseReason::Transport(e) => debug!("[{}] Transport error: {}", session, e),
    }
    reason
}

/// Releases a connection's registry entry when its task ends, including by
/// unwinding.
struct RegistrationGuard {
    id: ConnectionId,
    registry: Arc<ConnectionRegistry>,
    metrics: BridgeMetrics,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.release(self.id);
        self.metrics.connections_active.dec();
        self.metrics
            .owners_online
            .set(self.registry.owner_count() as i64);
    }
}

struct Session<'a> {
    id: ConnectionId,
    label: &'a str,
    conn: &'a mut ClientConnection,
    registry: &'a ConnectionRegistry,
    metrics: &'a BridgeMetrics,
    settings: &'a ConnectionSettings,
}

impl Session<'_> {
    async fn run<S>(&mut self, stream: S, mut outbound: mpsc::Receiver<Envelope>) -> CloseReason
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let handshake_deadline = deadline_after(Instant::now(), self.settings.handshake_timeout);
        let mut auth_deadline = deadline_after(handshake_deadline, self.settings.auth_timeout);
        // Only bytes from the peer count as activity; outbound traffic does not.
        let mut last_inbound = Instant::now();

        loop {
            let deadline = match self.conn.state() {
                ConnectionState::AwaitingHandshake => handshake_deadline,
                ConnectionState::AwaitingAuthorization => auth_deadline,
                ConnectionState::Authenticated => {
                    deadline_after(last_inbound, self.settings.idle_timeout)
                }
            };

            let n = tokio::select! {
                read = timeout_at(deadline, reader.read(&mut buf)) => match read {
                    Ok(Ok(0)) => return self.closed_by_peer(),
                    Ok(Ok(n)) => {
                        last_inbound = Instant::now();
                        n
                    }
                    Ok(Err(e)) => return CloseReason::Transport(e),
                    Err(_) => return CloseReason::Timeout(self.conn.state()),
                },
                Some(envelope) = outbound.recv() => {
                    let wire = match self.conn.send(&envelope) {
                        Ok(wire) => wire,
                        Err(e) => {
                            warn!("[{}] Dropping outbound envelope: {}", self.label, e);
                            continue;
                        }
                    };
                    if let Err(e) = writer.write_all(&wire).await {
                        return CloseReason::Transport(e);
                    }
                    self.metrics.messages_sent.inc();
                    continue;
                }
            };

            let mut events: VecDeque<ConnectionEvent> = match self.conn.feed(&buf[..n]) {
                Ok(events) => events.into(),
                Err(e) => return CloseReason::Protocol(e),
            };

            while let Some(event) = events.pop_front() {
                match event {
                    ConnectionEvent::HandshakeReply(reply) => {
                        if let Err(e) = writer.write_all(&reply).await {
                            return CloseReason::Transport(e);
                        }
                        auth_deadline = deadline_after(Instant::now(), self.settings.auth_timeout);
                        self.metrics.handshakes_completed.inc();
                        debug!("[{}] Handshake completed", self.label);
                    }
                    ConnectionEvent::AuthorizationRequest(auth) => {
                        let verdict = timeout_at(
                            auth_deadline,
                            self.registry.authorize(self.id, &auth.unique_id, &auth.token),
                        )
                        .await;
                        let owner_id = match verdict {
                            Ok(Ok(owner_id)) => owner_id,
                            Ok(Err(e)) => return CloseReason::Unauthorized(e),
                            Err(_) => return CloseReason::Timeout(self.conn.state()),
                        };
                        self.metrics.auth_accepted.inc();
                        let owners = self.registry.owner_count() as i64;
                        self.metrics.owners_online.set(owners);
                        debug!(
                            "[{}] Gateway {} authorized for owner {}",
                            self.label, auth.unique_id, owner_id
                        );
                        match self.conn.bind_owner(owner_id) {
                            Ok(more) => events.extend(more),
                            Err(e) => return CloseReason::Protocol(e),
                        }
                    }
                    ConnectionEvent::Message(envelope) => {
                        self.metrics.messages_received.inc();
                        if let Err(e) = self.registry.handle_message(self.id, envelope) {
                            warn!("[{}] Message not routed: {}", self.label, e);
                        }
                    }
                }
            }
        }
    }

    /// A peer that hangs up mid-handshake sent a short handshake.
    fn closed_by_peer(&self) -> CloseReason {
        let progress = self.conn.handshake_progress();
        if self.conn.state() == ConnectionState::AwaitingHandshake && progress > 0 {
            return CloseReason::Protocol(ConnectionError::KeyExchange(
                KeyExchangeError::InvalidLength(progress),
            ));
        }
        CloseReason::PeerClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_codec::FrameCodec;
    use crate::key_exchange::{mod_pow, HandshakeParams};
    use crate::session_cipher::SessionCipher;
    use crate::validator::{StaticTokenValidator, TokenValidator, ValidationError};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::io::DuplexStream;

    const PRIME: u32 = 0xFFFF_FFFB;
    const CLIENT_SECRET: u32 = 777;

    /// Accepts every token, but only after `delay`.
    struct SlowValidator {
        delay: Duration,
    }

    #[async_trait]
    impl TokenValidator for SlowValidator {
        async fn validate(&self, _token: &str) -> Result<String, ValidationError> {
            tokio::time::sleep(self.delay).await;
            Ok("u1".to_string())
        }
    }

    fn deps_with(
        validator: Arc<dyn TokenValidator>,
        settings: ConnectionSettings,
    ) -> ConnectionDeps {
        ConnectionDeps {
            registry: Arc::new(ConnectionRegistry::new(validator, vec!["fd/#".to_string()])),
            metrics: BridgeMetrics::new(),
            settings,
        }
    }

    fn deps(settings: ConnectionSettings) -> ConnectionDeps {
        let validator = StaticTokenValidator::new().with_token("abc", "u1");
        deps_with(Arc::new(validator), settings)
    }

    fn spawn(deps: &ConnectionDeps) -> (DuplexStream, tokio::task::JoinHandle<CloseReason>) {
        let (client, server) = tokio::io::duplex(8192);
        let deps = deps.clone();
        let task = tokio::spawn(async move { handle_connection(server, None, deps).await });
        (client, task)
    }

    async fn handshake(client: &mut DuplexStream) -> SessionCipher {
        let params = HandshakeParams {
            prime: PRIME,
            generator: 2,
            client_public: mod_pow(2, CLIENT_SECRET, PRIME),
        };
        client.write_all(&params.to_bytes()).await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        let shared = mod_pow(u32::from_be_bytes(reply), CLIENT_SECRET, PRIME);
        SessionCipher::new(shared.to_be_bytes(), IvChaining::Shared)
    }

    async fn send_json(client: &mut DuplexStream, cipher: &mut SessionCipher, value: Value) {
        let json = serde_json::to_vec(&value).unwrap();
        client
            .write_all(&FrameCodec::frame(&cipher.encrypt(&json)))
            .await
            .unwrap();
    }

    async fn recv_json(
        client: &mut DuplexStream,
        codec: &mut FrameCodec,
        cipher: &mut SessionCipher,
    ) -> Value {
        let mut buf = [0u8; 256];
        loop {
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0, "bridge closed the stream");
            if let Some(frame) = codec.feed(&buf[..n]).unwrap().into_iter().next() {
                return serde_json::from_slice(&cipher.decrypt(&frame).unwrap()).unwrap();
            }
        }
    }

    /// Handshake plus accepted authorization, with the default subscription
    /// consumed.
    async fn authenticate(client: &mut DuplexStream) -> (SessionCipher, FrameCodec) {
        let mut cipher = handshake(client).await;
        let mut codec = FrameCodec::default();
        send_json(client, &mut cipher, json!({"uniqueId": "dev-1", "token": "abc"})).await;
        let subscribe = recv_json(client, &mut codec, &mut cipher).await;
        assert_eq!(subscribe, json!({"action": "subscribe", "topic": "fd/#"}));
        (cipher, codec)
    }

    #[test]
    fn test_deadline_after_saturates() {
        let now = Instant::now();
        assert_eq!(
            deadline_after(now, Duration::from_secs(5)),
            now + Duration::from_secs(5)
        );
        assert_eq!(deadline_after(now, Duration::MAX), now + FAR_FUTURE);
    }

    #[tokio::test]
    async fn test_rejected_token_closes_silently() {
        let deps = deps(ConnectionSettings::default());
        let (mut client, task) = spawn(&deps);
        let mut cipher = handshake(&mut client).await;

        let json = serde_json::to_vec(&json!({"uniqueId": "dev-1", "token": "bad"})).unwrap();
        client
            .write_all(&FrameCodec::frame(&cipher.encrypt(&json)))
            .await
            .unwrap();

        let reason = task.await.unwrap();
        assert!(matches!(reason, CloseReason::Unauthorized(_)));

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(deps.registry.connection_count(), 0);
        assert_eq!(deps.metrics.auth_rejected.get(), 1);
    }

    #[tokio::test]
    async fn test_short_handshake_is_protocol_error() {
        let deps = deps(ConnectionSettings::default());
        let (mut client, task) = spawn(&deps);
        client.write_all(&[1, 2, 3, 4, 5]).await.unwrap();
        drop(client);

        let reason = task.await.unwrap();
        assert!(matches!(
            reason,
            CloseReason::Protocol(ConnectionError::KeyExchange(KeyExchangeError::InvalidLength(5)))
        ));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let settings = ConnectionSettings {
            handshake_timeout: Duration::from_millis(50),
            ..ConnectionSettings::default()
        };
        let deps = deps(settings);
        let (_client, task) = spawn(&deps);

        let reason = task.await.unwrap();
        assert!(matches!(
            reason,
            CloseReason::Timeout(ConnectionState::AwaitingHandshake)
        ));
        assert_eq!(deps.registry.connection_count(), 0);
        assert_eq!(deps.metrics.timeouts.get(), 1);
    }

    #[tokio::test]
    async fn test_missing_authorization_times_out() {
        let settings = ConnectionSettings {
            auth_timeout: Duration::from_millis(50),
            ..ConnectionSettings::default()
        };
        let deps = deps(settings);
        let (mut client, task) = spawn(&deps);
        let _cipher = handshake(&mut client).await;

        let reason = task.await.unwrap();
        assert!(matches!(
            reason,
            CloseReason::Timeout(ConnectionState::AwaitingAuthorization)
        ));
    }

    #[tokio::test]
    async fn test_slow_validator_times_out() {
        let settings = ConnectionSettings {
            auth_timeout: Duration::from_millis(100),
            ..ConnectionSettings::default()
        };
        let validator = Arc::new(SlowValidator {
            delay: Duration::from_secs(5),
        });
        let deps = deps_with(validator, settings);
        let (mut client, task) = spawn(&deps);
        let mut cipher = handshake(&mut client).await;
        send_json(&mut client, &mut cipher, json!({"uniqueId": "dev-1", "token": "abc"})).await;

        let reason = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("auth deadline bounds the validator")
            .unwrap();
        assert!(matches!(
            reason,
            CloseReason::Timeout(ConnectionState::AwaitingAuthorization)
        ));
        assert_eq!(deps.registry.owner_count(), 0);
        assert_eq!(deps.registry.connection_count(), 0);
        assert_eq!(deps.metrics.auth_accepted.get(), 0);
    }

    #[tokio::test]
    async fn test_outbound_traffic_does_not_keep_idle_gateway_open() {
        let settings = ConnectionSettings {
            idle_timeout: Duration::from_millis(300),
            ..ConnectionSettings::default()
        };
        let deps = deps(settings);
        let (mut client, task) = spawn(&deps);
        let _session = authenticate(&mut client).await;

        let registry = deps.registry.clone();
        let commands = tokio::spawn(async move {
            let mut sent = 0;
            while registry.send_command("u1", "td/dev-1/ping", json!({})).is_ok() {
                sent += 1;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            sent
        });

        let reason = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("silent gateway is closed")
            .unwrap();
        assert!(matches!(
            reason,
            CloseReason::Timeout(ConnectionState::Authenticated)
        ));
        assert_eq!(deps.registry.connection_count(), 0);
        assert!(commands.await.unwrap() > 1);
        drop(client);
    }

    #[tokio::test]
    async fn test_inbound_traffic_keeps_gateway_open() {
        let settings = ConnectionSettings {
            idle_timeout: Duration::from_millis(300),
            ..ConnectionSettings::default()
        };
        let deps = deps(settings);
        let (mut client, task) = spawn(&deps);
        let (mut cipher, _codec) = authenticate(&mut client).await;

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let status = json!({"action": "publish", "topic": "fd/dev-1/status", "message": {}});
            send_json(&mut client, &mut cipher, status).await;
        }
        assert_eq!(deps.registry.connection_count(), 1);

        drop(client);
        assert!(matches!(task.await.unwrap(), CloseReason::PeerClosed));
    }

    #[tokio::test]
    async fn test_unbounded_timeouts_do_not_overflow() {
        let config = BridgeConfig {
            handshake_timeout_secs: u64::MAX,
            auth_timeout_secs: u64::MAX,
            idle_timeout_secs: u64::MAX,
            ..BridgeConfig::default()
        };
        let deps = deps(ConnectionSettings::from(&config));
        let (mut client, task) = spawn(&deps);
        let _session = authenticate(&mut client).await;
        assert_eq!(deps.registry.owner_count(), 1);

        drop(client);
        assert!(matches!(task.await.unwrap(), CloseReason::PeerClosed));
        assert_eq!(deps.registry.connection_count(), 0);
        assert_eq!(deps.metrics.connections_active.get(), 0);
    }

    #[tokio::test]
    async fn test_peer_close_releases_registry() {
        let deps = deps(ConnectionSettings::default());
        let (mut client, task) = spawn(&deps);
        let mut cipher = handshake(&mut client).await;

        let json = serde_json::to_vec(&json!({"uniqueId": "dev-1", "token": "abc"})).unwrap();
        client
            .write_all(&FrameCodec::frame(&cipher.encrypt(&json)))
            .await
            .unwrap();

        // The default subscription arrives once the owner is bound.
        let mut codec = FrameCodec::default();
        let mut buf = [0u8; 256];
        let frames = loop {
            let n = client.read(&mut buf).await.unwrap();
            let frames = codec.feed(&buf[..n]).unwrap();
            if !frames.is_empty() {
                break frames;
            }
        };
        let subscribe: serde_json::Value =
            serde_json::from_slice(&cipher.decrypt(&frames[0]).unwrap()).unwrap();
        assert_eq!(subscribe, json!({"action": "subscribe", "topic": "fd/#"}));
        assert_eq!(deps.registry.owner_gateways("u1"), vec!["dev-1".to_string()]);

        drop(client);
        assert!(matches!(task.await.unwrap(), CloseReason::PeerClosed));
        assert_eq!(deps.registry.owner_count(), 0);
        assert_eq!(deps.metrics.connections_active.get(), 0);
    }
}
