// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Client Connection State Machine
//!
//! Protocol logic for one gateway socket, free of any I/O. The async driver
//! in [`crate::handler`] feeds it raw bytes and acts on the returned
//! [`ConnectionEvent`]s.
//!
//! ```text
//! AwaitingHandshake --12 bytes--> AwaitingAuthorization --verdict--> Authenticated
//! ```
//!
//! Once an authorization request has been emitted, further frames are held
//! undecrypted until [`ClientConnection::bind_owner`] is called. Every error
//! returned from [`ClientConnection::feed`] is fatal: the cipher chain cannot
//! be resynchronized.

use std::collections::VecDeque;

use serde_json::Value;
use thiserror::Error;

use crate::envelope::{AuthRequest, Envelope};
use crate::frame_codec::{FrameCodec, FrameError};
use crate::key_exchange::{KeyExchange, KeyExchangeError, HANDSHAKE_LEN, RESPONSE_LEN};
use crate::session_cipher::{CipherError, IvChaining, SessionCipher};

/// Protocol state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingHandshake,
    AwaitingAuthorization,
    Authenticated,
}

/// Something the driver has to act on.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Write these bytes to the peer in cleartext.
    HandshakeReply([u8; RESPONSE_LEN]),
    /// Ask the validator about this token, then call `bind_owner` or close.
    AuthorizationRequest(AuthRequest),
    /// A decrypted envelope from an authenticated peer.
    Message(Envelope),
}

/// Error type for connection processing.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    KeyExchange(#[from] KeyExchangeError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("invalid authorization envelope: {0}")]
    InvalidAuthorization(String),

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(#[source] serde_json::Error),

    #[error("failed to encode outbound envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("unexpected owner binding in state {0:?}")]
    UnexpectedVerdict(ConnectionState),

    #[error("handshake not complete")]
    HandshakeIncomplete,

    #[error("connection closed")]
    Closed,
}

impl ConnectionError {
    /// True for wire-level faults caused by the peer, false for misuse by the
    /// local caller.
    pub fn is_protocol_error(&self) -> bool {
        !matches!(
            self,
            ConnectionError::Encode(_)
                | ConnectionError::UnexpectedVerdict(_)
                | ConnectionError::HandshakeIncomplete
                | ConnectionError::Closed
        )
    }
}

/// Per-socket protocol state.
#[derive(Debug)]
pub struct ClientConnection {
    state: ConnectionState,
    key_exchange: KeyExchange,
    chaining: IvChaining,
    handshake: Vec<u8>,
    codec: FrameCodec,
    cipher: Option<SessionCipher>,
    pending: VecDeque<Vec<u8>>,
    verdict_pending: bool,
    unique_id: Option<String>,
    owner_id: Option<String>,
    closed: bool,
}

impl ClientConnection {
    pub fn new(key_exchange: KeyExchange, chaining: IvChaining, max_frame_size: usize) -> Self {
        ClientConnection {
            state: ConnectionState::AwaitingHandshake,
            key_exchange,
            chaining,
            handshake: Vec::with_capacity(HANDSHAKE_LEN),
            codec: FrameCodec::new(max_frame_size),
            cipher: None,
            pending: VecDeque::new(),
            verdict_pending: false,
            unique_id: None,
            owner_id: None,
            closed: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Peer-declared identity, once the authorization envelope was parsed.
    pub fn unique_id(&self) -> Option<&str> {
        self.unique_id.as_deref()
    }

    /// Owner bound by the validator.
    pub fn owner_id(&self) -> Option<&str> {
        self.owner_id.as_deref()
    }

    /// True while waiting for the validator's verdict.
    pub fn is_verdict_pending(&self) -> bool {
        self.verdict_pending
    }

    /// Bytes received during the handshake phase so far.
    pub fn handshake_progress(&self) -> usize {
        self.handshake.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Processes bytes read from the socket.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<ConnectionEvent>, ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }

        let mut events = Vec::new();
        let mut input = bytes;

        if self.state == ConnectionState::AwaitingHandshake {
            let take = (HANDSHAKE_LEN - self.handshake.len()).min(input.len());
            self.handshake.extend_from_slice(&input[..take]);
            input = &input[take..];
            if self.handshake.len() < HANDSHAKE_LEN {
                return Ok(events);
            }

            let outcome = self.key_exchange.exchange(&self.handshake)?;
            self.cipher = Some(SessionCipher::new(outcome.cipher_seed, self.chaining));
            self.state = ConnectionState::AwaitingAuthorization;
            events.push(ConnectionEvent::HandshakeReply(outcome.server_public));
        }

        if !input.is_empty() {
            self.pending.extend(self.codec.feed(input)?);
        }
        self.process_pending(&mut events)?;
        Ok(events)
    }

    /// Applies a positive verdict and processes any frames held back while
    /// it was pending.
    pub fn bind_owner(
        &mut self,
        owner_id: impl Into<String>,
    ) -> Result<Vec<ConnectionEvent>, ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        if self.state != ConnectionState::AwaitingAuthorization || !self.verdict_pending {
            return Err(ConnectionError::UnexpectedVerdict(self.state));
        }

        self.owner_id = Some(owner_id.into());
        self.state = ConnectionState::Authenticated;
        self.verdict_pending = false;

        let mut events = Vec::new();
        self.process_pending(&mut events)?;
        Ok(events)
    }

    /// Serializes, encrypts and frames an envelope for the peer.
    pub fn send(&mut self, envelope: &Envelope) -> Result<Vec<u8>, ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        let cipher = self
            .cipher
            .as_mut()
            .ok_or(ConnectionError::HandshakeIncomplete)?;
        let json = serde_json::to_vec(envelope).map_err(ConnectionError::Encode)?;
        Ok(FrameCodec::frame(&cipher.encrypt(&json)))
    }

    /// Marks the connection closed and drops buffered input. Returns true on
    /// the first call only.
    pub fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.verdict_pending = false;
        self.pending.clear();
        self.codec.reset();
        true
    }

    fn process_pending(
        &mut self,
        events: &mut Vec<ConnectionEvent>,
    ) -> Result<(), ConnectionError> {
        while !self.verdict_pending {
            let Some(frame) = self.pending.pop_front() else {
                break;
            };
            let cipher = self
                .cipher
                .as_mut()
                .ok_or(ConnectionError::HandshakeIncomplete)?;
            let plaintext = cipher.decrypt(&frame)?;

            match self.state {
                ConnectionState::AwaitingAuthorization => {
                    let auth = parse_auth_request(&plaintext)?;
                    self.unique_id = Some(auth.unique_id.clone());
                    self.verdict_pending = true;
                    events.push(ConnectionEvent::AuthorizationRequest(auth));
                }
                ConnectionState::Authenticated => {
                    let envelope = parse_envelope(&plaintext)?;
                    events.push(ConnectionEvent::Message(envelope));
                }
                ConnectionState::AwaitingHandshake => {
                    return Err(ConnectionError::HandshakeIncomplete);
                }
            }
        }
        Ok(())
    }
}

fn parse_auth_request(plaintext: &[u8]) -> Result<AuthRequest, ConnectionError> {
    let value: Value = serde_json::from_slice(plaintext).map_err(ConnectionError::InvalidJson)?;
    let field = |name: &str| {
        value
            .get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ConnectionError::InvalidAuthorization(format!("missing {}", name)))
    };
    Ok(AuthRequest {
        unique_id: field("uniqueId")?,
        token: field("token")?,
    })
}

fn parse_envelope(plaintext: &[u8]) -> Result<Envelope, ConnectionError> {
    let value: Value = serde_json::from_slice(plaintext).map_err(ConnectionError::InvalidJson)?;
    serde_json::from_value(value).map_err(ConnectionError::InvalidEnvelope)
}
