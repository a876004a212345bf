//! Protocol messages for Handover.
//!
//! These are the inner payloads wrapped in an [`Envelope`]. Every
//! envelope kind has exactly one payload struct, so consumers match
//! exhaustively instead of duck-typing on a dynamic payload.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{Delta, DeviceId, DeviceRecord, Platform, Session, SessionId, SyncError, WriteStamp};

pub use crate::envelope::MessageType;

/// All possible protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Liveness probe.
    Heartbeat(Heartbeat),
    /// Reply to a heartbeat.
    HeartbeatAck(HeartbeatAck),
    /// Subscribe to a session's delta stream.
    Subscribe(Subscribe),
    /// Unsubscribe from a session.
    Unsubscribe(Unsubscribe),
    /// Full-tree replacement.
    StateUpdate(StateUpdate),
    /// A batch of deltas from one flush.
    StateDelta(StateDelta),
    /// Bearer-token authentication.
    Auth(Auth),
    /// Successful authentication.
    AuthSuccess(AuthSuccess),
    /// Authoritative server-known tree.
    StateSync(StateSync),
    /// Acknowledgement of applied deltas.
    Ack(Ack),
    /// Device roster after subscribing.
    Connected(Connected),
    /// A device joined.
    DeviceJoined(DeviceJoined),
    /// A device left.
    DeviceLeft(DeviceLeft),
    /// Protocol-level error notice.
    Error(ErrorNotice),
}

impl Message {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        rmp_serde::to_vec(self).map_err(SyncError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        rmp_serde::from_slice(bytes).map_err(SyncError::Deserialization)
    }

    /// The envelope discriminator for this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Heartbeat(_) => MessageType::Heartbeat,
            Message::HeartbeatAck(_) => MessageType::HeartbeatAck,
            Message::Subscribe(_) => MessageType::Subscribe,
            Message::Unsubscribe(_) => MessageType::Unsubscribe,
            Message::StateUpdate(_) => MessageType::StateUpdate,
            Message::StateDelta(_) => MessageType::StateDelta,
            Message::Auth(_) => MessageType::Auth,
            Message::AuthSuccess(_) => MessageType::AuthSuccess,
            Message::StateSync(_) => MessageType::StateSync,
            Message::Ack(_) => MessageType::Ack,
            Message::Connected(_) => MessageType::Connected,
            Message::DeviceJoined(_) => MessageType::DeviceJoined,
            Message::DeviceLeft(_) => MessageType::DeviceLeft,
            Message::Error(_) => MessageType::Error,
        }
    }
}

/// Liveness probe. The sequence number pairs probes with acks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Monotonic per-connection sequence number.
    pub seq: u64,
    /// Sender wall-clock time in millis, echoed back for latency.
    pub sent_at: u64,
}

/// Reply to a [`Heartbeat`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    /// The sequence number being acknowledged.
    pub seq: u64,
    /// `sent_at` echoed from the probe.
    pub sent_at: u64,
}

/// Subscribe to the live delta stream of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscribe {
    /// The session to subscribe to.
    pub session_id: SessionId,
}

/// Unsubscribe from a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unsubscribe {
    /// The session to unsubscribe from.
    pub session_id: SessionId,
}

/// Full-tree replacement for a session (e.g. after a snapshot restore).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    /// The complete tree, path to value.
    pub tree: BTreeMap<String, serde_json::Value>,
}

/// A batch of deltas produced by one flush, applied in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    /// The deltas, in flush order.
    pub deltas: Vec<Delta>,
}

/// Bearer-token authentication, the first message on a connection.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auth {
    /// Bearer token from the auth collaborator.
    pub token: String,
    /// The authenticating device.
    pub device_id: DeviceId,
    /// Human-readable device name.
    pub display_name: String,
    /// The device platform.
    pub platform: Platform,
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth")
            .field("token", &"[REDACTED]")
            .field("device_id", &self.device_id)
            .field("display_name", &self.display_name)
            .field("platform", &self.platform)
            .finish()
    }
}

/// Successful authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSuccess {
    /// The authenticated session.
    pub session: Session,
}

/// The authoritative server-known tree, sent in response to Subscribe.
///
/// Seeds the local store only for paths without a newer local pending
/// write (local-writes-win during the seed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSync {
    /// The server-known tree, path to value.
    pub tree: BTreeMap<String, serde_json::Value>,
    /// Server wall-clock time in millis when the sync was captured.
    pub server_time: u64,
}

/// One acknowledged write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckEntry {
    /// The acknowledged path.
    pub path: String,
    /// The stamp of the acknowledged write.
    pub stamp: WriteStamp,
}

/// Acknowledgement that deltas were applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// The acknowledged writes.
    pub entries: Vec<AckEntry>,
}

/// Device roster delivered right after subscribing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connected {
    /// All devices currently in the session, primary flag included.
    pub devices: Vec<DeviceRecord>,
}

/// A device joined the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceJoined {
    /// The joining device.
    pub device: DeviceRecord,
}

/// Why a device left a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaveReason {
    /// The connection dropped.
    Disconnected,
    /// The device unsubscribed explicitly.
    Left,
    /// The primary device kicked it. Terminal for the target.
    Kicked,
    /// Presence timeout elapsed without a heartbeat.
    PresenceTimeout,
}

/// A device left the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLeft {
    /// The departing device.
    pub device_id: DeviceId,
    /// Why it left.
    pub reason: LeaveReason,
}

/// Typed error codes carried in [`ErrorNotice`] payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Bearer token rejected.
    NotAuthenticated,
    /// The session has expired.
    SessionExpired,
    /// Handoff token expired or already consumed.
    HandoffTokenInvalid,
    /// Catch-all server-side failure.
    Internal,
}

/// A protocol-level error notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    /// The error code.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DeltaOp, SessionStatus, Timestamp};
    use serde_json::json;

    #[test]
    fn heartbeat_roundtrip() {
        let hb = Heartbeat {
            seq: 7,
            sent_at: 1_705_000_000_000,
        };

        let bytes = rmp_serde::to_vec(&hb).unwrap();
        let restored: Heartbeat = rmp_serde::from_slice(&bytes).unwrap();

        assert_eq!(hb, restored);
    }

    #[test]
    fn subscribe_roundtrip() {
        let sub = Subscribe {
            session_id: SessionId::new(),
        };

        let bytes = rmp_serde::to_vec(&sub).unwrap();
        let restored: Subscribe = rmp_serde::from_slice(&bytes).unwrap();

        assert_eq!(sub.session_id, restored.session_id);
    }

    #[test]
    fn state_delta_with_batch() {
        let origin = crate::DeviceId::random();
        let msg = Message::StateDelta(StateDelta {
            deltas: vec![
                Delta::write(
                    DeltaOp::Add,
                    "cart.items",
                    json!([1, 2]),
                    origin,
                    Timestamp::from_millis(1),
                ),
                Delta::remove("cart.coupon", origin, Timestamp::from_millis(2)),
            ],
        });

        let bytes = msg.to_bytes().unwrap();
        let restored = Message::from_bytes(&bytes).unwrap();

        match restored {
            Message::StateDelta(sd) => {
                assert_eq!(sd.deltas.len(), 2);
                assert_eq!(sd.deltas[0].path, "cart.items");
                assert_eq!(sd.deltas[1].op, DeltaOp::Remove);
            }
            other => panic!("expected StateDelta, got {:?}", other),
        }
    }

    #[test]
    fn state_sync_roundtrip() {
        let mut tree = BTreeMap::new();
        tree.insert("a.b".to_string(), json!(1));
        tree.insert("a.c".to_string(), json!("two"));

        let msg = Message::StateSync(StateSync {
            tree,
            server_time: 1_705_000_000_000,
        });

        let bytes = msg.to_bytes().unwrap();
        let restored = Message::from_bytes(&bytes).unwrap();

        match restored {
            Message::StateSync(sync) => {
                assert_eq!(sync.tree.len(), 2);
                assert_eq!(sync.tree["a.b"], json!(1));
            }
            other => panic!("expected StateSync, got {:?}", other),
        }
    }

    #[test]
    fn auth_success_roundtrip() {
        let msg = Message::AuthSuccess(AuthSuccess {
            session: Session {
                session_id: SessionId::new(),
                user_id: "user-1".into(),
                created_at: Timestamp::from_millis(1),
                expires_at: Timestamp::from_millis(2),
                status: SessionStatus::Active,
            },
        });

        let bytes = msg.to_bytes().unwrap();
        let restored = Message::from_bytes(&bytes).unwrap();

        assert!(matches!(restored, Message::AuthSuccess(_)));
    }

    #[test]
    fn device_left_with_kick_reason() {
        let msg = Message::DeviceLeft(DeviceLeft {
            device_id: crate::DeviceId::random(),
            reason: LeaveReason::Kicked,
        });

        let bytes = msg.to_bytes().unwrap();
        let restored = Message::from_bytes(&bytes).unwrap();

        match restored {
            Message::DeviceLeft(left) => assert_eq!(left.reason, LeaveReason::Kicked),
            other => panic!("expected DeviceLeft, got {:?}", other),
        }
    }

    #[test]
    fn error_notice_roundtrip() {
        let msg = Message::Error(ErrorNotice {
            code: ErrorCode::SessionExpired,
            message: "session lapsed 5m ago".into(),
        });

        let bytes = msg.to_bytes().unwrap();
        let restored = Message::from_bytes(&bytes).unwrap();

        match restored {
            Message::Error(notice) => assert_eq!(notice.code, ErrorCode::SessionExpired),
            other => panic!("expected Error, got {:?}", other),
        }
    }

    #[test]
    fn message_type_matches_variant() {
        let msg = Message::Heartbeat(Heartbeat { seq: 1, sent_at: 0 });
        assert_eq!(msg.message_type(), MessageType::Heartbeat);

        let msg = Message::Ack(Ack { entries: vec![] });
        assert_eq!(msg.message_type(), MessageType::Ack);
    }

    #[test]
    fn auth_debug_redacts_token() {
        let auth = Auth {
            token: "super-secret-bearer".into(),
            device_id: crate::DeviceId::random(),
            display_name: "phone".into(),
            platform: Platform::Ios,
        };
        let debug = format!("{:?}", auth);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("super-secret-bearer"));
    }
}
