//! Device and session records.

use serde::{Deserialize, Serialize};

use crate::{DeviceId, SessionId, Timestamp};

/// The platform a device runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Platform {
    /// iPhone/iPad app.
    Ios,
    /// Android app.
    Android,
    /// Browser tab.
    Web,
    /// Desktop app.
    Desktop,
    /// Anything else.
    Other,
}

/// A connected device as tracked by presence.
///
/// Created on successful auth handshake, removed on explicit leave,
/// kick, or presence timeout. Exactly one record in a session has
/// `is_primary = true` whenever at least one device is connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// The device identifier.
    pub device_id: DeviceId,
    /// Human-readable name shown in device lists.
    pub display_name: String,
    /// The device platform.
    pub platform: Platform,
    /// Whether this device owns session-level decisions.
    pub is_primary: bool,
    /// When the device joined the session.
    pub connected_at: Timestamp,
    /// Last time the device was seen alive.
    pub last_seen_at: Timestamp,
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    /// The session is live.
    Active,
    /// The session exists but no device is using it.
    Inactive,
    /// The session was suspended server-side.
    Suspended,
    /// The session has expired. Terminal.
    Expired,
}

/// The logical unit of user state that can be handed off between devices.
///
/// Mutated by the server on extension/expiry; the client only observes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// The session identifier.
    pub session_id: SessionId,
    /// The owning user.
    pub user_id: String,
    /// When the session was created.
    pub created_at: Timestamp,
    /// When the session expires.
    pub expires_at: Timestamp,
    /// Current status.
    pub status: SessionStatus,
}

impl Session {
    /// Whether the session has passed its expiry or was marked expired.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.status == SessionStatus::Expired || now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session(expires_at: u64, status: SessionStatus) -> Session {
        Session {
            session_id: SessionId::new(),
            user_id: "user-1".into(),
            created_at: Timestamp::from_millis(1_000),
            expires_at: Timestamp::from_millis(expires_at),
            status,
        }
    }

    #[test]
    fn session_not_expired_before_deadline() {
        let session = test_session(10_000, SessionStatus::Active);
        assert!(!session.is_expired(Timestamp::from_millis(9_999)));
    }

    #[test]
    fn session_expired_at_deadline() {
        let session = test_session(10_000, SessionStatus::Active);
        assert!(session.is_expired(Timestamp::from_millis(10_000)));
    }

    #[test]
    fn expired_status_is_terminal_regardless_of_clock() {
        let session = test_session(10_000, SessionStatus::Expired);
        assert!(session.is_expired(Timestamp::from_millis(0)));
    }

    #[test]
    fn device_record_roundtrip() {
        let record = DeviceRecord {
            device_id: DeviceId::random(),
            display_name: "Alex's phone".into(),
            platform: Platform::Ios,
            is_primary: true,
            connected_at: Timestamp::from_millis(1_000),
            last_seen_at: Timestamp::from_millis(2_000),
        };

        let bytes = rmp_serde::to_vec(&record).unwrap();
        let restored: DeviceRecord = rmp_serde::from_slice(&bytes).unwrap();

        assert_eq!(record, restored);
    }
}
