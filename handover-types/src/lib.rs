//! # handover-types
//!
//! Wire format types for the Handover session sync protocol.
//!
//! This crate provides the foundational types used across all Handover crates:
//! - [`SessionId`], [`DeviceId`], [`TokenId`], [`Timestamp`] - Identity and ordering types
//! - [`Delta`], [`WriteStamp`] - Path-scoped state changes and their precedence key
//! - [`Envelope`] - Message wrapper with routing metadata
//! - [`Message`] - Protocol messages (Auth, StateDelta, Heartbeat, etc.)
//! - [`SyncError`] - Error taxonomy

#![warn(missing_docs)]
#![warn(clippy::all)]

mod delta;
mod device;
mod envelope;
mod error;
mod ids;
mod messages;

pub use delta::{Delta, DeltaOp, PendingWrite, WriteStamp};
pub use device::{DeviceRecord, Platform, Session, SessionStatus};
pub use envelope::Envelope;
pub use error::SyncError;
pub use ids::{DeviceId, SessionId, Timestamp, TokenId};
pub use messages::{
    Ack, AckEntry, Auth, AuthSuccess, Connected, DeviceJoined, DeviceLeft, ErrorCode,
    ErrorNotice, Heartbeat, HeartbeatAck, LeaveReason, Message, MessageType, StateDelta,
    StateSync, StateUpdate, Subscribe, Unsubscribe,
};
