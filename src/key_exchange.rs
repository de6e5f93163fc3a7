// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Handshake Key Exchange
//!
//! Finite-field Diffie-Hellman where the initiator chooses every public
//! parameter. The 12-byte cleartext handshake carries
//! `prime | generator | client_public`, each a big-endian `u32`. The responder
//! answers with its own 4-byte big-endian public value.
//!
//! The negotiated secret is only 32 bits wide; it is an obfuscation layer
//! imposed by the gateway firmware, not a security boundary.

use rand::Rng;
use thiserror::Error;

/// Length of the initiator's cleartext handshake.
pub const HANDSHAKE_LEN: usize = 12;

/// Length of the responder's cleartext reply.
pub const RESPONSE_LEN: usize = 4;

/// Error type for the key exchange.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyExchangeError {
    #[error("handshake must be exactly {HANDSHAKE_LEN} bytes, got {0}")]
    InvalidLength(usize),

    #[error("handshake prime is zero")]
    ZeroModulus,
}

/// Parameters announced by the initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeParams {
    pub prime: u32,
    pub generator: u32,
    pub client_public: u32,
}

impl HandshakeParams {
    /// Parses the 12-byte cleartext handshake.
    pub fn parse(bytes: &[u8]) -> Result<Self, KeyExchangeError> {
        if bytes.len() != HANDSHAKE_LEN {
            return Err(KeyExchangeError::InvalidLength(bytes.len()));
        }
        let word = |i: usize| {
            u32::from_be_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]])
        };
        let params = HandshakeParams {
            prime: word(0),
            generator: word(4),
            client_public: word(8),
        };
        if params.prime == 0 {
            return Err(KeyExchangeError::ZeroModulus);
        }
        Ok(params)
    }

    /// Serializes the parameters as the initiator sends them.
    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        let mut out = [0u8; HANDSHAKE_LEN];
        out[..4].copy_from_slice(&self.prime.to_be_bytes());
        out[4..8].copy_from_slice(&self.generator.to_be_bytes());
        out[8..].copy_from_slice(&self.client_public.to_be_bytes());
        out
    }
}

/// Result of a completed exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeOutcome {
    /// Big-endian shared secret, fed to the session cipher.
    pub cipher_seed: [u8; 4],
    /// Big-endian responder public value, written back in cleartext.
    pub server_public: [u8; RESPONSE_LEN],
}

/// Computes `base^exponent mod modulus` with 64-bit intermediates.
///
/// Operands are reduced below `modulus` (at most `u32::MAX`) before every
/// multiplication, so each product fits in a `u64`.
pub fn mod_pow(base: u32, exponent: u32, modulus: u32) -> u32 {
    if modulus == 1 {
        return 0;
    }
    let modulus = u64::from(modulus);
    let mut result: u64 = 1;
    let mut base = u64::from(base) % modulus;
    let mut exponent = exponent;
    while exponent > 0 {
        if exponent & 1 == 1 {
            result = result * base % modulus;
        }
        base = base * base % modulus;
        exponent >>= 1;
    }
    result as u32
}

/// Responder side of the exchange, holding the private scalar.
#[derive(Clone)]
pub struct KeyExchange {
    secret: u32,
}

impl std::fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyExchange").finish_non_exhaustive()
    }
}

impl KeyExchange {
    /// Creates a responder with a fixed private scalar.
    pub fn with_secret(secret: u32) -> Self {
        KeyExchange { secret }
    }

    /// Creates a responder with a fresh random scalar in `2..u32::MAX`.
    pub fn random() -> Self {
        KeyExchange {
            secret: rand::thread_rng().gen_range(2..u32::MAX),
        }
    }

    /// Runs the exchange for a raw 12-byte handshake.
    pub fn exchange(&self, bytes: &[u8]) -> Result<ExchangeOutcome, KeyExchangeError> {
        let params = HandshakeParams::parse(bytes)?;
        Ok(self.respond(&params))
    }

    /// Runs the exchange for already-parsed parameters.
    pub fn respond(&self, params: &HandshakeParams) -> ExchangeOutcome {
        let server_public = mod_pow(params.generator, self.secret, params.prime);
        let shared = mod_pow(params.client_public, self.secret, params.prime);
        ExchangeOutcome {
            cipher_seed: shared.to_be_bytes(),
            server_public: server_public.to_be_bytes(),
        }
    }
}
