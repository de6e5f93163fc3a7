// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Token Validation
//!
//! The registry asks an injected [`TokenValidator`] which owner a gateway
//! token belongs to. Real deployments back this with the account store;
//! [`StaticTokenValidator`] serves fixed tables from configuration and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

/// Reasons a token was not accepted. Neither is reported to the peer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unknown token")]
    UnknownToken,

    #[error("validator unavailable: {0}")]
    Unavailable(String),
}

/// Maps a gateway token to the owning account.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Returns the owner id for `token`.
    async fn validate(&self, token: &str) -> Result<String, ValidationError>;
}

/// Fixed token → owner table.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenValidator {
    tokens: HashMap<String, String>,
}

impl StaticTokenValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a token for `owner_id`, builder style.
    pub fn with_token(mut self, token: impl Into<String>, owner_id: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), owner_id.into());
        self
    }

    /// Parses `token=owner` pairs separated by commas. Malformed pairs are
    /// skipped.
    pub fn parse(table: &str) -> Self {
        let tokens = table
            .split(',')
            .filter_map(|pair| {
                let (token, owner) = pair.split_once('=')?;
                let (token, owner) = (token.trim(), owner.trim());
                if token.is_empty() || owner.is_empty() {
                    return None;
                }
                Some((token.to_string(), owner.to_string()))
            })
            .collect();
        StaticTokenValidator { tokens }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> Result<String, ValidationError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(ValidationError::UnknownToken)
    }
}
