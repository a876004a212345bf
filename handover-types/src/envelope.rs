//! Envelope - the wire format wrapper for all sync messages.

use serde::{Deserialize, Serialize};

use crate::{DeviceId, SessionId, SyncError, Timestamp};

/// Message type discriminator for envelope routing.
///
/// The numeric values are a stable wire contract; never renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Liveness probe.
    Heartbeat = 1,
    /// Reply to a heartbeat; the round trip measures latency.
    HeartbeatAck = 2,
    /// Subscribe to a session's delta stream.
    Subscribe = 3,
    /// Unsubscribe from a session's delta stream.
    Unsubscribe = 4,
    /// Full-tree replacement for a session.
    StateUpdate = 5,
    /// A batch of path-scoped deltas.
    StateDelta = 6,
    /// Bearer-token authentication.
    Auth = 7,
    /// Successful authentication, carries session + device roster.
    AuthSuccess = 8,
    /// Authoritative server-known tree, sent after Subscribe.
    StateSync = 9,
    /// Acknowledgement of applied deltas.
    Ack = 10,
    /// Initial device roster after subscribing.
    Connected = 11,
    /// A device joined the session.
    DeviceJoined = 12,
    /// A device left the session (or was kicked).
    DeviceLeft = 13,
    /// A protocol-level error notice.
    Error = 14,
}

impl TryFrom<u8> for MessageType {
    type Error = SyncError;

    fn try_from(value: u8) -> Result<Self, SyncError> {
        match value {
            1 => Ok(MessageType::Heartbeat),
            2 => Ok(MessageType::HeartbeatAck),
            3 => Ok(MessageType::Subscribe),
            4 => Ok(MessageType::Unsubscribe),
            5 => Ok(MessageType::StateUpdate),
            6 => Ok(MessageType::StateDelta),
            7 => Ok(MessageType::Auth),
            8 => Ok(MessageType::AuthSuccess),
            9 => Ok(MessageType::StateSync),
            10 => Ok(MessageType::Ack),
            11 => Ok(MessageType::Connected),
            12 => Ok(MessageType::DeviceJoined),
            13 => Ok(MessageType::DeviceLeft),
            14 => Ok(MessageType::Error),
            _ => Err(SyncError::InvalidMessageType(value)),
        }
    }
}

/// The envelope wraps all protocol messages with routing metadata.
///
/// Envelopes for a given device are sent and processed in FIFO order
/// within one connection generation; across reconnects delivery is
/// best-effort and content is re-derived from current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version (currently 1).
    pub version: u8,
    /// Message type discriminator.
    pub msg_type: u8,
    /// Sender's device ID.
    pub sender_id: DeviceId,
    /// The session this envelope belongs to.
    pub session_id: SessionId,
    /// Sender wall-clock time. Informational, not trusted.
    pub timestamp: Timestamp,
    /// MessagePack-encoded inner message.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Create a new envelope for sending.
    pub fn new(
        msg_type: MessageType,
        sender_id: DeviceId,
        session_id: SessionId,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: 1,
            msg_type: msg_type as u8,
            sender_id,
            session_id,
            timestamp: Timestamp::now(),
            payload,
        }
    }

    /// Create a minimal envelope for testing.
    pub fn minimal() -> Self {
        Self {
            version: 1,
            msg_type: MessageType::Heartbeat as u8,
            sender_id: DeviceId::random(),
            session_id: SessionId::new(),
            timestamp: Timestamp::from_millis(0),
            payload: vec![],
        }
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        rmp_serde::to_vec(self).map_err(SyncError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        rmp_serde::from_slice(bytes).map_err(SyncError::Deserialization)
    }

    /// Get the message type as an enum.
    pub fn message_type(&self) -> Result<MessageType, SyncError> {
        MessageType::try_from(self.msg_type)
    }
}
