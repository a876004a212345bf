//! Last-write-wins conflict resolution.
//!
//! Concurrent writes to the same path are ordered by
//! [`WriteStamp`](handover_types::WriteStamp): origin timestamp first,
//! device-id byte order on ties. The order is total and shared by every
//! observer, so all devices converge to the same final value for any
//! path once in-flight writes settle - no central sequencer required.
//!
//! A remove participates as a tombstone write: it carries a stamp like
//! any other write, and a later add/replace overrides it.

use std::collections::HashMap;

use handover_types::{Delta, WriteStamp};

/// What to do with an incoming remote delta.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Apply the delta to the tree and notify subscribers.
    Apply,
    /// Apply the delta; it supersedes an unacknowledged local write to
    /// the same path, which the caller must drop from its write queue.
    ApplyOverLocal,
    /// A newer local write is pending for the path. The delta is parked
    /// and only surfaces if that local write is discarded unflushed.
    Deferred,
    /// Older than the write already applied to the path; drop it.
    Stale,
}

/// Tracks write precedence per path.
///
/// `applied` is the stamp of whatever the local tree currently shows.
/// `pending` is the subset of applied stamps that came from local
/// writes not yet acknowledged. `deferred` parks the newest remote
/// delta that lost to a pending local write.
#[derive(Debug, Default)]
pub struct Resolver {
    applied: HashMap<String, WriteStamp>,
    pending: HashMap<String, WriteStamp>,
    deferred: HashMap<String, Delta>,
}

impl Resolver {
    /// Create an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a local write. The write is visible in the local tree
    /// immediately, so it becomes both pending and applied. A later
    /// local write to the same path supersedes the earlier stamp.
    pub fn record_local(&mut self, path: &str, stamp: WriteStamp) {
        self.pending.insert(path.to_string(), stamp);
        self.applied.insert(path.to_string(), stamp);
    }

    /// Decide what to do with a remote delta.
    pub fn resolve_remote(&mut self, delta: &Delta) -> Resolution {
        let stamp = delta.stamp();

        if let Some(local) = self.pending.get(&delta.path).copied() {
            if stamp > local {
                self.pending.remove(&delta.path);
                self.deferred.remove(&delta.path);
                self.applied.insert(delta.path.clone(), stamp);
                return Resolution::ApplyOverLocal;
            }
            // Local write is newer; park the remote in case the local
            // write never makes it out.
            let keep = self
                .deferred
                .get(&delta.path)
                .map_or(true, |parked| stamp > parked.stamp());
            if keep {
                self.deferred.insert(delta.path.clone(), delta.clone());
            }
            return Resolution::Deferred;
        }

        if let Some(applied) = self.applied.get(&delta.path).copied() {
            if stamp <= applied {
                return Resolution::Stale;
            }
        }

        self.applied.insert(delta.path.clone(), stamp);
        Resolution::Apply
    }

    /// Clear a pending local write after the sync layer acknowledged it.
    ///
    /// Only clears when the stamp matches: a later local write to the
    /// same path stays pending. The acknowledged write remains the
    /// winner, so any parked remote (necessarily older) is dropped.
    pub fn ack_local(&mut self, path: &str, stamp: WriteStamp) {
        if self.pending.get(path) == Some(&stamp) {
            self.pending.remove(path);
            self.deferred.remove(path);
        }
    }

    /// Discard a pending local write that will never be flushed.
    ///
    /// If a remote delta was parked behind it, that delta is now the
    /// best known value for the path - the caller applies it.
    pub fn discard_local(&mut self, path: &str) -> Option<Delta> {
        self.pending.remove(path)?;
        let parked = self.deferred.remove(path)?;
        self.applied.insert(path.to_string(), parked.stamp());
        Some(parked)
    }

    /// Number of paths with unacknowledged local writes.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether a path has an unacknowledged local write.
    pub fn has_pending(&self, path: &str) -> bool {
        self.pending.contains_key(path)
    }

    /// The stamp currently applied to a path, if any write was seen.
    pub fn applied_stamp(&self, path: &str) -> Option<WriteStamp> {
        self.applied.get(path).copied()
    }
}
