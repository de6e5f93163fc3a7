// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Session Cipher
//!
//! AES-128-CBC with a chained IV, keyed from the 4-byte handshake secret:
//!
//! - key = MD5(seed)
//! - initial IV = MD5(key)
//! - plaintext is zero-padded to a block boundary (nothing added when aligned)
//! - after every call the IV becomes the last ciphertext block of that call
//!
//! Messages must be processed strictly in order. A skipped or reordered
//! message leaves the chain unrecoverable.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};
use thiserror::Error;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Error type for session cipher operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("ciphertext length {0} is not a multiple of the block size")]
    UnalignedCiphertext(usize),
}

/// How the IV chain is shared between the two directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IvChaining {
    /// A single IV advanced by both `encrypt` and `decrypt`. This is what
    /// deployed gateways do.
    #[default]
    Shared,
    /// Independent transmit and receive chains, both starting from the
    /// initial IV.
    PerDirection,
}

impl std::str::FromStr for IvChaining {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "shared" => Ok(IvChaining::Shared),
            "per-direction" | "per_direction" | "split" => Ok(IvChaining::PerDirection),
            other => Err(format!("unknown IV chaining mode: {}", other)),
        }
    }
}

/// Per-connection cipher state.
pub struct SessionCipher {
    key: [u8; 16],
    mode: IvChaining,
    tx_iv: [u8; 16],
    rx_iv: [u8; 16],
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl SessionCipher {
    /// Derives key and initial IV from the handshake secret.
    pub fn new(seed: [u8; 4], mode: IvChaining) -> Self {
        let key: [u8; 16] = Md5::digest(seed).into();
        let iv: [u8; 16] = Md5::digest(key).into();
        SessionCipher {
            key,
            mode,
            tx_iv: iv,
            rx_iv: iv,
        }
    }

    /// The IV the next `encrypt` call will use.
    pub fn encrypt_iv(&self) -> [u8; 16] {
        self.tx_iv
    }

    /// The IV the next `decrypt` call will use.
    pub fn decrypt_iv(&self) -> [u8; 16] {
        match self.mode {
            IvChaining::Shared => self.tx_iv,
            IvChaining::PerDirection => self.rx_iv,
        }
    }

    /// Zero-pads and encrypts `plaintext`, then advances the chain.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let padded_len = plaintext.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
        let mut buf = vec![0u8; padded_len];
        buf[..plaintext.len()].copy_from_slice(plaintext);
        if buf.is_empty() {
            return buf;
        }

        let mut encryptor = Aes128CbcEnc::new(&self.key.into(), &self.tx_iv.into());
        for block in buf.chunks_exact_mut(BLOCK_SIZE) {
            encryptor.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }

        self.advance_tx(&buf);
        buf
    }

    /// Decrypts `ciphertext`, strips trailing zero bytes, then advances the
    /// chain to the last ciphertext block.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        if ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(CipherError::UnalignedCiphertext(ciphertext.len()));
        }
        if ciphertext.is_empty() {
            return Ok(Vec::new());
        }

        let mut buf = ciphertext.to_vec();
        let mut decryptor = Aes128CbcDec::new(&self.key.into(), &self.decrypt_iv().into());
        for block in buf.chunks_exact_mut(BLOCK_SIZE) {
            decryptor.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }

        self.advance_rx(ciphertext);

        let len = buf.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        buf.truncate(len);
        Ok(buf)
    }

    fn advance_tx(&mut self, ciphertext: &[u8]) {
        let last = last_block(ciphertext);
        self.tx_iv = last;
        if self.mode == IvChaining::Shared {
            self.rx_iv = last;
        }
    }

    fn advance_rx(&mut self, ciphertext: &[u8]) {
        let last = last_block(ciphertext);
        self.rx_iv = last;
        if self.mode == IvChaining::Shared {
            self.tx_iv = last;
        }
    }
}

fn last_block(ciphertext: &[u8]) -> [u8; 16] {
    let mut block = [0u8; 16];
    block.copy_from_slice(&ciphertext[ciphertext.len() - BLOCK_SIZE..]);
    block
}
