//! Identity and ordering types for Handover.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// A unique identifier for a device participating in a session.
///
/// 32 bytes of random data, displayed as URL-safe base64. The derived
/// `Ord` (byte order) is the deterministic tie-break for concurrent
/// writes with equal timestamps, so every observer ranks devices the
/// same way.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId([u8; 32]);

impl DeviceId {
    /// Create a new random DeviceId.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self(bytes)
    }

    /// Create a DeviceId from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() == 32 {
            let mut arr = [0u8; 32];
            arr.copy_from_slice(bytes);
            Some(Self(arr))
        } else {
            None
        }
    }

    /// Get the raw bytes of this DeviceId.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", &self.to_string()[..8])
    }
}

/// A unique identifier for a user session.
///
/// UUID v4 format (16 bytes). Minted by the session-issuance API; the
/// engine only carries it around.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    /// Create a new random SessionId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Create a SessionId from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        uuid::Uuid::from_slice(bytes).ok().map(Self)
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

/// A unique identifier for a handoff token.
///
/// 32 bytes of random data, displayed as URL-safe base64.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenId([u8; 32]);

impl TokenId {
    /// Create a new random TokenId.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self(bytes)
    }

    /// Create a TokenId from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() == 32 {
            let mut arr = [0u8; 32];
            arr.copy_from_slice(bytes);
            Some(Self(arr))
        } else {
            None
        }
    }

    /// Get the raw bytes of this TokenId.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenId({})", &self.to_string()[..8])
    }
}

/// A wall-clock timestamp in milliseconds since the Unix epoch.
///
/// The first half of the LWW precedence key. Device clocks can drift,
/// which is why equal values fall back to [`DeviceId`] byte order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a Timestamp with the given millisecond value.
    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self(millis)
    }

    /// Get the millisecond value.
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Saturating addition of a millisecond offset.
    pub fn saturating_add_millis(&self, millis: u64) -> Self {
        Self(self.0.saturating_add(millis))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_roundtrip() {
        let original = DeviceId::random();
        let bytes = original.as_bytes();
        let restored = DeviceId::from_bytes(bytes).unwrap();
        assert_eq!(original, restored);
    }

    #[test]
    fn device_id_base64_display() {
        let id = DeviceId::random();
        let display = id.to_string();
        assert_eq!(display.len(), 43); // 32 bytes = 43 base64 chars (no padding)
    }

    #[test]
    fn device_id_from_invalid_length_fails() {
        assert!(DeviceId::from_bytes(&[0u8; 16]).is_none());
        assert!(DeviceId::from_bytes(&[0u8; 64]).is_none());
    }

    #[test]
    fn device_id_ordering_is_byte_order() {
        let low = DeviceId::from_bytes(&[0u8; 32]).unwrap();
        let high = DeviceId::from_bytes(&[0xFF; 32]).unwrap();
        assert!(low < high);
    }

    #[test]
    fn session_id_is_uuid_v4() {
        let id = SessionId::new();
        assert_eq!(id.as_uuid().get_version_num(), 4);
    }

    #[test]
    fn session_id_roundtrip() {
        let original = SessionId::new();
        let restored = SessionId::from_bytes(original.as_uuid().as_bytes()).unwrap();
        assert_eq!(original, restored);
    }

    #[test]
    fn token_id_roundtrip() {
        let original = TokenId::random();
        let restored = TokenId::from_bytes(original.as_bytes()).unwrap();
        assert_eq!(original, restored);
    }

    #[test]
    fn token_ids_are_unique() {
        assert_ne!(TokenId::random(), TokenId::random());
    }

    #[test]
    fn timestamp_ordering() {
        let t1 = Timestamp::from_millis(100);
        let t2 = Timestamp::from_millis(200);
        assert!(t1 < t2);
    }

    #[test]
    fn timestamp_now_is_recent() {
        let ts = Timestamp::now();
        // After 2020-01-01 in millis
        assert!(ts.as_millis() > 1_577_836_800_000);
    }

    #[test]
    fn timestamp_saturating_add() {
        let ts = Timestamp::from_millis(u64::MAX);
        assert_eq!(ts.saturating_add_millis(10).as_millis(), u64::MAX);
    }
}
