//! Device presence roster for a session.
//!
//! Tracks which devices are currently attached to a session and which
//! of them is primary. Exactly one device is primary whenever the
//! roster is non-empty: the one with the earliest `connected_at`,
//! device-id order breaking ties. Every mutation re-runs the election,
//! so primary failover on disconnect needs no separate code path.

use std::collections::BTreeMap;

use handover_types::{DeviceId, DeviceRecord, LeaveReason, Timestamp};
use thiserror::Error;

/// Changes produced by a roster mutation, in the order they occurred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    /// A device joined the session.
    Joined(DeviceId),
    /// A device left the session.
    Left(DeviceId, LeaveReason),
    /// The primary role moved to a different device.
    PrimaryChanged(DeviceId),
}

/// Errors from privileged roster operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PresenceError {
    /// The requesting device is not the primary.
    #[error("operation requires the primary device")]
    NotPrimary,
    /// The target device is not in the roster.
    #[error("device {0} is not in the session")]
    UnknownDevice(DeviceId),
}

/// The set of devices attached to one session.
#[derive(Debug, Clone, Default)]
pub struct PresenceSet {
    devices: BTreeMap<DeviceId, DeviceRecord>,
}

impl PresenceSet {
    /// Create an empty roster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update a device. Re-joining refreshes the record but
    /// keeps the original `connected_at` so primary seniority survives
    /// a reconnect.
    pub fn join(&mut self, mut record: DeviceRecord) -> Vec<PresenceChange> {
        let device_id = record.device_id;
        let rejoining = if let Some(existing) = self.devices.get(&device_id) {
            record.connected_at = existing.connected_at;
            true
        } else {
            false
        };
        self.devices.insert(device_id, record);

        let mut changes = Vec::new();
        if !rejoining {
            changes.push(PresenceChange::Joined(device_id));
        }
        changes.extend(self.elect());
        changes
    }

    /// Remove a device from the roster.
    pub fn leave(&mut self, device_id: DeviceId, reason: LeaveReason) -> Vec<PresenceChange> {
        if self.devices.remove(&device_id).is_none() {
            return vec![];
        }
        let mut changes = vec![PresenceChange::Left(device_id, reason)];
        changes.extend(self.elect());
        changes
    }

    /// Forcibly remove a device. Only the primary may kick, and a
    /// device cannot kick itself.
    pub fn kick(
        &mut self,
        requester: DeviceId,
        target: DeviceId,
    ) -> Result<Vec<PresenceChange>, PresenceError> {
        if self.primary().map(|d| d.device_id) != Some(requester) {
            return Err(PresenceError::NotPrimary);
        }
        if !self.devices.contains_key(&target) {
            return Err(PresenceError::UnknownDevice(target));
        }
        Ok(self.leave(target, LeaveReason::Kicked))
    }

    /// Refresh a device's liveness timestamp (heartbeat or any traffic).
    pub fn touch(&mut self, device_id: DeviceId, now: Timestamp) {
        if let Some(record) = self.devices.get_mut(&device_id) {
            record.last_seen_at = now;
        }
    }

    /// Drop every device whose last activity is older than `ttl_millis`.
    pub fn expire_stale(&mut self, now: Timestamp, ttl_millis: u64) -> Vec<PresenceChange> {
        let stale: Vec<DeviceId> = self
            .devices
            .values()
            .filter(|d| now.as_millis().saturating_sub(d.last_seen_at.as_millis()) > ttl_millis)
            .map(|d| d.device_id)
            .collect();

        let mut changes = Vec::new();
        for device_id in stale {
            self.devices.remove(&device_id);
            changes.push(PresenceChange::Left(device_id, LeaveReason::PresenceTimeout));
        }
        if !changes.is_empty() {
            changes.extend(self.elect());
        }
        changes
    }

    /// Replace the roster wholesale (from a Connected message).
    pub fn replace_all(&mut self, records: Vec<DeviceRecord>) -> Vec<PresenceChange> {
        self.devices = records.into_iter().map(|r| (r.device_id, r)).collect();
        self.elect()
    }

    /// The current primary device, if any device is present.
    pub fn primary(&self) -> Option<&DeviceRecord> {
        self.devices.values().find(|d| d.is_primary)
    }

    /// Look up one device.
    pub fn get(&self, device_id: &DeviceId) -> Option<&DeviceRecord> {
        self.devices.get(device_id)
    }

    /// Whether a device is in the roster.
    pub fn contains(&self, device_id: &DeviceId) -> bool {
        self.devices.contains_key(device_id)
    }

    /// All devices, in device-id order.
    pub fn devices(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.values()
    }

    /// Number of devices present.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the roster is empty.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Re-run the primary election: earliest `connected_at` wins,
    /// device-id order breaks ties. Returns a change only when the
    /// primary actually moved.
    fn elect(&mut self) -> Vec<PresenceChange> {
        let winner = self
            .devices
            .values()
            .min_by_key(|d| (d.connected_at, d.device_id))
            .map(|d| d.device_id);

        let Some(winner) = winner else {
            return vec![];
        };

        let previous = self
            .devices
            .values()
            .find(|d| d.is_primary)
            .map(|d| d.device_id);

        for record in self.devices.values_mut() {
            record.is_primary = record.device_id == winner;
        }

        if previous == Some(winner) {
            vec![]
        } else {
            vec![PresenceChange::PrimaryChanged(winner)]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use handover_types::Platform;

    fn record(byte: u8, connected_millis: u64) -> DeviceRecord {
        DeviceRecord {
            device_id: DeviceId::from_bytes(&[byte; 32]).unwrap(),
            display_name: format!("device-{}", byte),
            platform: Platform::Web,
            is_primary: false,
            connected_at: Timestamp::from_millis(connected_millis),
            last_seen_at: Timestamp::from_millis(connected_millis),
        }
    }

    fn id(byte: u8) -> DeviceId {
        DeviceId::from_bytes(&[byte; 32]).unwrap()
    }

    #[test]
    fn first_device_becomes_primary() {
        let mut set = PresenceSet::new();
        let changes = set.join(record(1, 100));

        assert_eq!(set.primary().unwrap().device_id, id(1));
        assert!(changes.contains(&PresenceChange::Joined(id(1))));
        assert!(changes.contains(&PresenceChange::PrimaryChanged(id(1))));
    }

    #[test]
    fn earliest_connected_wins_primary() {
        let mut set = PresenceSet::new();
        set.join(record(2, 200));
        let changes = set.join(record(1, 100));

        // Device 1 connected earlier, so primary moves to it.
        assert_eq!(set.primary().unwrap().device_id, id(1));
        assert!(changes.contains(&PresenceChange::PrimaryChanged(id(1))));
    }

    #[test]
    fn equal_connect_times_tie_break_by_device_id() {
        let mut set = PresenceSet::new();
        set.join(record(2, 100));
        set.join(record(1, 100));

        assert_eq!(set.primary().unwrap().device_id, id(1));
    }

    #[test]
    fn exactly_one_primary_always() {
        let mut set = PresenceSet::new();
        set.join(record(3, 300));
        set.join(record(1, 100));
        set.join(record(2, 200));

        let primaries = set.devices().filter(|d| d.is_primary).count();
        assert_eq!(primaries, 1);
    }

    #[test]
    fn primary_failover_on_leave() {
        let mut set = PresenceSet::new();
        set.join(record(1, 100));
        set.join(record(2, 200));
        set.join(record(3, 300));

        let changes = set.leave(id(1), LeaveReason::Disconnected);

        assert!(changes.contains(&PresenceChange::Left(id(1), LeaveReason::Disconnected)));
        assert!(changes.contains(&PresenceChange::PrimaryChanged(id(2))));
        assert_eq!(set.primary().unwrap().device_id, id(2));

        set.leave(id(2), LeaveReason::Left);
        assert_eq!(set.primary().unwrap().device_id, id(3));
    }

    #[test]
    fn leave_of_unknown_device_is_noop() {
        let mut set = PresenceSet::new();
        set.join(record(1, 100));

        let changes = set.leave(id(9), LeaveReason::Left);
        assert!(changes.is_empty());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn rejoin_keeps_original_seniority() {
        let mut set = PresenceSet::new();
        set.join(record(1, 100));
        set.join(record(2, 200));

        // Device 1 rejoins later; its seniority is preserved and it
        // stays primary.
        set.join(record(1, 999));

        assert_eq!(set.primary().unwrap().device_id, id(1));
        assert_eq!(set.get(&id(1)).unwrap().connected_at, Timestamp::from_millis(100));
    }

    #[test]
    fn only_primary_can_kick() {
        let mut set = PresenceSet::new();
        set.join(record(1, 100));
        set.join(record(2, 200));

        assert_eq!(set.kick(id(2), id(1)), Err(PresenceError::NotPrimary));

        let changes = set.kick(id(1), id(2)).unwrap();
        assert!(changes.contains(&PresenceChange::Left(id(2), LeaveReason::Kicked)));
        assert!(!set.contains(&id(2)));
    }

    #[test]
    fn kick_unknown_device_is_error() {
        let mut set = PresenceSet::new();
        set.join(record(1, 100));

        assert_eq!(
            set.kick(id(1), id(9)),
            Err(PresenceError::UnknownDevice(id(9)))
        );
    }

    #[test]
    fn expire_stale_drops_quiet_devices() {
        let mut set = PresenceSet::new();
        set.join(record(1, 100));
        set.join(record(2, 100));

        set.touch(id(2), Timestamp::from_millis(10_000));
        let changes = set.expire_stale(Timestamp::from_millis(10_000), 5_000);

        assert!(changes.contains(&PresenceChange::Left(id(1), LeaveReason::PresenceTimeout)));
        assert!(!set.contains(&id(1)));
        assert!(set.contains(&id(2)));
        // Primary moved to the survivor.
        assert_eq!(set.primary().unwrap().device_id, id(2));
    }

    #[test]
    fn replace_all_reelects() {
        let mut set = PresenceSet::new();
        set.join(record(1, 100));

        let changes = set.replace_all(vec![record(5, 50), record(6, 60)]);
        assert_eq!(set.len(), 2);
        assert_eq!(set.primary().unwrap().device_id, id(5));
        assert!(changes.contains(&PresenceChange::PrimaryChanged(id(5))));
    }
}
