//! Path-scoped state changes and their precedence key.
//!
//! A [`Delta`] is the unit of wire transfer and of conflict resolution:
//! one operation on one dot-delimited path. Concurrent deltas for the
//! same path are ordered by [`WriteStamp`] (timestamp, then device id),
//! which is a total order shared by every observer.

use serde::{Deserialize, Serialize};

use crate::{DeviceId, Timestamp};

/// The kind of change a delta carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaOp {
    /// A value written to a path that did not exist.
    Add,
    /// A value overwriting an existing path.
    Replace,
    /// A path removed. Participates in LWW ordering as a tombstone
    /// write, so a later Add/Replace overrides it.
    Remove,
}

/// A single path-scoped change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// Operation kind.
    pub op: DeltaOp,
    /// Dot-delimited path into the state tree.
    pub path: String,
    /// The new value. `None` for Remove.
    pub value: Option<serde_json::Value>,
    /// The device that produced this delta.
    pub origin: DeviceId,
    /// Wall-clock time at the origin when the write happened.
    pub timestamp: Timestamp,
}

impl Delta {
    /// Create an Add/Replace delta.
    pub fn write(
        op: DeltaOp,
        path: impl Into<String>,
        value: serde_json::Value,
        origin: DeviceId,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            op,
            path: path.into(),
            value: Some(value),
            origin,
            timestamp,
        }
    }

    /// Create a Remove (tombstone) delta.
    pub fn remove(path: impl Into<String>, origin: DeviceId, timestamp: Timestamp) -> Self {
        Self {
            op: DeltaOp::Remove,
            path: path.into(),
            value: None,
            origin,
            timestamp,
        }
    }

    /// The precedence key of this delta.
    pub fn stamp(&self) -> WriteStamp {
        WriteStamp {
            timestamp: self.timestamp,
            device_id: self.origin,
        }
    }
}

/// The total order over concurrent writes to a path.
///
/// Timestamps compare first; equal timestamps fall back to device-id
/// byte order. Derived `Ord` on the field order gives exactly that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WriteStamp {
    /// Origin wall-clock time.
    pub timestamp: Timestamp,
    /// Origin device, the tie-break.
    pub device_id: DeviceId,
}

/// A local mutation not yet acknowledged by the sync layer.
///
/// Created by `set_state`, removed on Ack or when superseded by a later
/// local write to the same path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    /// Dot-delimited path into the state tree.
    pub path: String,
    /// The value written. `None` means the path was removed.
    pub value: Option<serde_json::Value>,
    /// Local wall-clock time of the write.
    pub timestamp: Timestamp,
    /// The writing device.
    pub device_id: DeviceId,
    /// Whether the path held a value before this write. Decides
    /// Add vs Replace on the wire.
    pub path_existed: bool,
}

impl PendingWrite {
    /// The precedence key of this write.
    pub fn stamp(&self) -> WriteStamp {
        WriteStamp {
            timestamp: self.timestamp,
            device_id: self.device_id,
        }
    }

    /// Convert this pending write into the delta that represents it on
    /// the wire.
    pub fn to_delta(&self) -> Delta {
        let op = match (&self.value, self.path_existed) {
            (None, _) => DeltaOp::Remove,
            (Some(_), true) => DeltaOp::Replace,
            (Some(_), false) => DeltaOp::Add,
        };
        Delta {
            op,
            path: self.path.clone(),
            value: self.value.clone(),
            origin: self.device_id,
            timestamp: self.timestamp,
        }
    }
}
