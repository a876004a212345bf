//! Error taxonomy for Handover.

use thiserror::Error;

/// Errors that can occur in Handover operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An operation was attempted on a destroyed store.
    #[error("store is closed")]
    StoreClosed,

    /// No valid bearer token is available.
    #[error("not authenticated")]
    NotAuthenticated,

    /// The owning session has expired.
    #[error("session expired")]
    SessionExpired,

    /// A handoff token was expired, already consumed, or malformed.
    /// Distinct from [`SyncError::SessionExpired`] so callers can render
    /// the right recovery UI.
    #[error("handoff token invalid: {0}")]
    HandoffTokenInvalid(String),

    /// The connection could not be established or was lost terminally.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// MessagePack serialization failed.
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed.
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// Reserved for future non-LWW merge policies; the current policy
    /// never raises this.
    #[error("conflict unresolvable")]
    ConflictUnresolvable,

    /// Invalid message type discriminator on the wire.
    #[error("invalid message type: {0}")]
    InvalidMessageType(u8),

    /// A state-tree path failed validation.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// An operation exceeded its timeout.
    #[error("operation timed out")]
    Timeout,

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}
