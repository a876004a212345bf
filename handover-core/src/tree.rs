//! The per-device state tree.
//!
//! A mapping from dot-delimited path to JSON value. Every device holds
//! its own copy; trees are never shared by reference across devices and
//! are reconciled only through deltas. Backed by a `BTreeMap` so that
//! serialization order is deterministic and quiescent devices produce
//! byte-for-byte identical snapshots.

use std::collections::BTreeMap;

use handover_types::{Delta, DeltaOp, DeviceId, SyncError, Timestamp};

/// The mutable state tree owned by one device's store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateTree {
    entries: BTreeMap<String, serde_json::Value>,
}

/// Validate a state-tree path: non-empty, no empty dot segments.
pub fn validate_path(path: &str) -> Result<(), SyncError> {
    if path.is_empty() {
        return Err(SyncError::InvalidPath("empty path".into()));
    }
    if path.split('.').any(|segment| segment.is_empty()) {
        return Err(SyncError::InvalidPath(format!(
            "empty segment in '{}'",
            path
        )));
    }
    Ok(())
}

impl StateTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from a path→value map (e.g. a StateSync payload).
    pub fn from_map(map: BTreeMap<String, serde_json::Value>) -> Self {
        Self { entries: map }
    }

    /// Set a value, returning the previous value if the path existed.
    pub fn set(
        &mut self,
        path: &str,
        value: serde_json::Value,
    ) -> Result<Option<serde_json::Value>, SyncError> {
        validate_path(path)?;
        Ok(self.entries.insert(path.to_string(), value))
    }

    /// Remove a path, returning the previous value if it existed.
    pub fn remove(&mut self, path: &str) -> Option<serde_json::Value> {
        self.entries.remove(path)
    }

    /// Read a single path.
    pub fn get(&self, path: &str) -> Option<&serde_json::Value> {
        self.entries.get(path)
    }

    /// Whether a path currently holds a value.
    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Number of paths in the tree.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the tree is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The full path→value map, in deterministic path order.
    pub fn as_map(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.entries
    }

    /// Clone the tree into an owned map (for snapshots and persistence).
    pub fn to_map(&self) -> BTreeMap<String, serde_json::Value> {
        self.entries.clone()
    }

    /// Apply a delta in place. Returns the affected path's new value
    /// (`None` for a removal that took effect or hit a missing path).
    pub fn apply(&mut self, delta: &Delta) -> Result<Option<serde_json::Value>, SyncError> {
        validate_path(&delta.path)?;
        match (delta.op, &delta.value) {
            (DeltaOp::Remove, _) => {
                self.entries.remove(&delta.path);
                Ok(None)
            }
            (DeltaOp::Add | DeltaOp::Replace, Some(value)) => {
                self.entries.insert(delta.path.clone(), value.clone());
                Ok(Some(value.clone()))
            }
            (DeltaOp::Add | DeltaOp::Replace, None) => Err(SyncError::Internal(format!(
                "write delta without value for '{}'",
                delta.path
            ))),
        }
    }

    /// Diff this tree against a newer one, producing the deltas that
    /// transform `self` into `newer`, stamped with the given origin.
    pub fn diff(&self, newer: &StateTree, origin: DeviceId, timestamp: Timestamp) -> Vec<Delta> {
        let mut deltas = Vec::new();

        for (path, value) in &newer.entries {
            match self.entries.get(path) {
                None => deltas.push(Delta::write(
                    DeltaOp::Add,
                    path.clone(),
                    value.clone(),
                    origin,
                    timestamp,
                )),
                Some(old) if old != value => deltas.push(Delta::write(
                    DeltaOp::Replace,
                    path.clone(),
                    value.clone(),
                    origin,
                    timestamp,
                )),
                Some(_) => {}
            }
        }

        for path in self.entries.keys() {
            if !newer.entries.contains_key(path) {
                deltas.push(Delta::remove(path.clone(), origin, timestamp));
            }
        }

        deltas
    }

    /// Serialize the tree to JSON bytes for persistence.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, SyncError> {
        serde_json::to_vec(&self.entries).map_err(|e| SyncError::Internal(e.to_string()))
    }

    /// Restore a tree from persisted JSON bytes.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        let entries = serde_json::from_slice(bytes).map_err(|e| SyncError::Internal(e.to_string()))?;
        Ok(Self { entries })
    }

    /// Approximate in-memory size of the tree in bytes.
    ///
    /// Cheap to compute and good enough for growth detection; not an
    /// exact allocator measurement.
    pub fn approx_size_bytes(&self) -> usize {
        self.entries
            .iter()
            .map(|(path, value)| path.len() + approx_value_size(value))
            .sum()
    }
}

fn approx_value_size(value: &serde_json::Value) -> usize {
    match value {
        serde_json::Value::Null => 4,
        serde_json::Value::Bool(_) => 5,
        serde_json::Value::Number(_) => 8,
        serde_json::Value::String(s) => s.len() + 2,
        serde_json::Value::Array(items) => 2 + items.iter().map(approx_value_size).sum::<usize>(),
        serde_json::Value::Object(map) => {
            2 + map
                .iter()
                .map(|(k, v)| k.len() + 3 + approx_value_size(v))
                .sum::<usize>()
        }
    }
}
