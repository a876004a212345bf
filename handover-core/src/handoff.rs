//! Session handoff tokens.
//!
//! A handoff token lets a second device join an existing session
//! without re-authenticating from scratch: the issuing device bundles
//! the token with a state snapshot into a compact payload (QR code or
//! deep link), and the joining device presents the token to redeem it.
//!
//! Tokens are short-lived and single-use. The [`TokenLedger`] is the
//! one place redemption is validated; its states only move forward
//! (`Created → Consumed` or `Created → Expired`), so a replayed
//! payload can never re-open a consumed token.

use std::collections::{BTreeMap, HashMap};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use handover_types::{DeviceId, SessionId, SyncError, Timestamp, TokenId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Payload format version. Bump on incompatible changes.
pub const HANDOFF_VERSION: u8 = 1;

/// Default token lifetime: 2 minutes.
pub const DEFAULT_HANDOFF_TTL: u64 = 120_000;

/// Errors from issuing or redeeming a handoff token.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandoffError {
    /// The token's lifetime elapsed before redemption.
    #[error("handoff token expired")]
    Expired,
    /// The token was already redeemed once.
    #[error("handoff token already used")]
    AlreadyConsumed,
    /// The token is not in the ledger.
    #[error("unknown handoff token")]
    Unknown,
    /// The encoded payload did not decode.
    #[error("invalid handoff payload: {0}")]
    InvalidPayload(String),
    /// The payload was produced by an incompatible version.
    #[error("unsupported handoff version: {0}")]
    UnsupportedVersion(u8),
}

impl From<HandoffError> for SyncError {
    fn from(e: HandoffError) -> Self {
        SyncError::HandoffTokenInvalid(e.to_string())
    }
}

/// A single-use credential for joining an existing session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffToken {
    /// Payload format version.
    pub version: u8,
    /// Random token identifier.
    pub token: TokenId,
    /// Session the token grants access to.
    pub session_id: SessionId,
    /// Device that issued the token.
    pub issuing_device: DeviceId,
    /// Issue time.
    pub created_at: Timestamp,
    /// Expiry time.
    pub expires_at: Timestamp,
}

impl HandoffToken {
    /// Issue a fresh token for a session.
    pub fn issue(
        session_id: SessionId,
        issuing_device: DeviceId,
        now: Timestamp,
        ttl_millis: u64,
    ) -> Self {
        Self {
            version: HANDOFF_VERSION,
            token: TokenId::random(),
            session_id,
            issuing_device,
            created_at: now,
            expires_at: now.saturating_add_millis(ttl_millis),
        }
    }

    /// Whether the token is past its expiry.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

/// Token plus a snapshot of the issuing device's state tree, encoded
/// for out-of-band transfer (QR code, deep link).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffPayload {
    /// The credential itself.
    pub token: HandoffToken,
    /// State tree at issue time, so the joining device can render
    /// immediately while live sync catches up.
    pub snapshot: BTreeMap<String, serde_json::Value>,
}

impl HandoffPayload {
    /// Encode as a URL-safe base64 string.
    pub fn to_qr_payload(&self) -> Result<String, HandoffError> {
        let json = serde_json::to_vec(self).map_err(|e| HandoffError::InvalidPayload(e.to_string()))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Decode a scanned payload. Rejects unknown format versions before
    /// anything else is looked at.
    pub fn from_qr_payload(encoded: &str) -> Result<Self, HandoffError> {
        let json = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| HandoffError::InvalidPayload(e.to_string()))?;
        let payload: Self =
            serde_json::from_slice(&json).map_err(|e| HandoffError::InvalidPayload(e.to_string()))?;
        if payload.token.version != HANDOFF_VERSION {
            return Err(HandoffError::UnsupportedVersion(payload.token.version));
        }
        Ok(payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenState {
    Created,
    Consumed,
    Expired,
}

/// Tracks issued tokens and enforces single use.
///
/// State moves forward only. An expired token stays expired even if
/// clocks disagree, and a consumed token never becomes redeemable again.
#[derive(Debug, Default)]
pub struct TokenLedger {
    tokens: HashMap<TokenId, (HandoffToken, TokenState)>,
}

impl TokenLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly issued token.
    pub fn register(&mut self, token: HandoffToken) {
        self.tokens.insert(token.token, (token, TokenState::Created));
    }

    /// Redeem a token. Succeeds exactly once per token, and only
    /// before expiry; returns the token's session on success.
    pub fn redeem(&mut self, token_id: &TokenId, now: Timestamp) -> Result<SessionId, HandoffError> {
        let (token, state) = self.tokens.get_mut(token_id).ok_or(HandoffError::Unknown)?;

        match *state {
            TokenState::Consumed => Err(HandoffError::AlreadyConsumed),
            TokenState::Expired => Err(HandoffError::Expired),
            TokenState::Created if token.is_expired(now) => {
                *state = TokenState::Expired;
                Err(HandoffError::Expired)
            }
            TokenState::Created => {
                *state = TokenState::Consumed;
                Ok(token.session_id)
            }
        }
    }

    /// Mark every token past its expiry, and drop consumed or expired
    /// entries older than `retain_millis` to bound ledger growth.
    pub fn sweep(&mut self, now: Timestamp, retain_millis: u64) {
        for (token, state) in self.tokens.values_mut() {
            if *state == TokenState::Created && token.is_expired(now) {
                *state = TokenState::Expired;
            }
        }
        self.tokens.retain(|_, (token, state)| {
            *state == TokenState::Created
                || now.as_millis().saturating_sub(token.expires_at.as_millis()) <= retain_millis
        });
    }

    /// Number of tokens tracked (any state).
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the ledger is empty.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
