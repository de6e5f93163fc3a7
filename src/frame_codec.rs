// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Frame Codec
//!
//! Splits the post-handshake byte stream into discrete messages and joins
//! messages back into wire frames.
//!
//! Wire format: `START (0x42) | escaped(payload) | END (0x43)`. The three
//! reserved bytes are stuffed inside the payload as two-byte sequences:
//!
//! | raw    | escaped       |
//! |--------|---------------|
//! | `0x42` | `0x44, 0x62`  |
//! | `0x43` | `0x44, 0x63`  |
//! | `0x44` | `0x44, 0x64`  |
//!
//! Unescaping is strict: an escape byte followed by anything other than the
//! three codes above is rejected rather than masked.

use bytes::{Buf, BytesMut};
use thiserror::Error;

/// Frame start sentinel.
pub const START: u8 = 0x42;
/// Frame end sentinel.
pub const END: u8 = 0x43;
/// Escape marker.
pub const ESCAPE: u8 = 0x44;

/// Default cap on a single unterminated frame held in the buffer.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Framing failures. All of them are fatal for the connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// An escape marker was followed by an unknown code.
    #[error("invalid escape sequence 0x44 0x{code:02x}")]
    InvalidEscape { code: u8 },

    /// An escape marker was the last byte of the frame body.
    #[error("truncated escape sequence at end of frame")]
    TruncatedEscape,

    /// The peer kept sending without terminating the frame.
    #[error("frame too large: {size} bytes buffered, maximum {max}")]
    FrameTooLarge { size: usize, max: usize },
}

/// Stateful frame splitter.
///
/// Holds any partial frame between [`FrameCodec::feed`] calls.
#[derive(Debug)]
pub struct FrameCodec {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl FrameCodec {
    /// Creates a codec that refuses to buffer frames above `max_frame_size`
    /// escaped bytes.
    pub fn new(max_frame_size: usize) -> Self {
        FrameCodec {
            buffer: BytesMut::new(),
            max_frame_size,
        }
    }

    /// Escapes `payload` and wraps it in start/end sentinels.
    pub fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + payload.len() / 8 + 2);
        out.push(START);
        for &byte in payload {
            match byte {
                START | END | ESCAPE => {
                    out.push(ESCAPE);
                    out.push(byte | 0x20);
                }
                _ => out.push(byte),
            }
        }
        out.push(END);
        out
    }

    /// Reverses the byte stuffing applied by [`FrameCodec::frame`].
    pub fn unescape(body: &[u8]) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::with_capacity(body.len());
        let mut iter = body.iter().copied();
        while let Some(byte) = iter.next() {
            if byte != ESCAPE {
                out.push(byte);
                continue;
            }
            match iter.next() {
                Some(0x62) => out.push(START),
                Some(0x63) => out.push(END),
                Some(0x64) => out.push(ESCAPE),
                Some(code) => return Err(FrameError::InvalidEscape { code }),
                None => return Err(FrameError::TruncatedEscape),
            }
        }
        Ok(out)
    }

    /// Appends `chunk` to the internal buffer and returns every complete,
    /// unescaped payload now available, in arrival order.
    ///
    /// Bytes before the first start sentinel are discarded. An incomplete
    /// trailing frame is kept for the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
        self.buffer.extend_from_slice(chunk);
        let mut messages = Vec::new();

        loop {
            match self.buffer.iter().position(|&b| b == START) {
                Some(start) => self.buffer.advance(start),
                None => {
                    self.buffer.clear();
                    break;
                }
            }

            let Some(end) = self.buffer.iter().position(|&b| b == END) else {
                if self.buffer.len() > self.max_frame_size {
                    return Err(FrameError::FrameTooLarge {
                        size: self.buffer.len(),
                        max: self.max_frame_size,
                    });
                }
                break;
            };

            let frame = self.buffer.split_to(end + 1);
            messages.push(Self::unescape(&frame[1..end])?);
        }

        Ok(messages)
    }

    /// Discards any buffered partial frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of bytes currently held back waiting for a frame end.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}
