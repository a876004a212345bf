//! Write queue for outgoing local mutations.
//!
//! Writes flow through three stages:
//! 1. `mark_dirty()` - the debounce window is open; repeated writes to
//!    the same path collapse, keeping only the last value
//! 2. `take_dirty()` / `take_path()` - flushed onto the wire, moved to
//!    the in-flight set until acknowledged
//! 3. `ack()` - delivery confirmed, the write is dropped
//!
//! On reconnect, `requeue_in_flight()` moves unacknowledged writes back
//! to dirty so they are re-derived from current state rather than
//! replayed verbatim.

use std::collections::{BTreeMap, BTreeSet};

use handover_types::{PendingWrite, WriteStamp};

/// Per-path queue of local writes awaiting flush or acknowledgement.
#[derive(Debug, Default)]
pub struct WriteQueue {
    /// Writes inside their debounce window, newest value per path.
    dirty: BTreeMap<String, PendingWrite>,
    /// Writes flushed but not yet acknowledged.
    in_flight: BTreeMap<String, PendingWrite>,
}

impl WriteQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a local write. A later write to the same path supersedes
    /// the earlier one - only the last value within a window flushes.
    pub fn mark_dirty(&mut self, write: PendingWrite) {
        self.dirty.insert(write.path.clone(), write);
    }

    /// Drain every dirty path for a flush, moving them in-flight.
    pub fn take_dirty(&mut self) -> Vec<PendingWrite> {
        let drained: Vec<PendingWrite> = std::mem::take(&mut self.dirty).into_values().collect();
        for write in &drained {
            self.in_flight.insert(write.path.clone(), write.clone());
        }
        drained
    }

    /// Flush a single path (per-path debounce timers fire independently).
    pub fn take_path(&mut self, path: &str) -> Option<PendingWrite> {
        let write = self.dirty.remove(path)?;
        self.in_flight.insert(path.to_string(), write.clone());
        Some(write)
    }

    /// Acknowledge delivery of a flushed write. Only clears when the
    /// stamp matches; a newer in-flight write for the path survives.
    pub fn ack(&mut self, path: &str, stamp: WriteStamp) {
        if self.in_flight.get(path).map(|w| w.stamp()) == Some(stamp) {
            self.in_flight.remove(path);
        }
    }

    /// Drop a path from both stages (remote write superseded it).
    pub fn discard(&mut self, path: &str) {
        self.dirty.remove(path);
        self.in_flight.remove(path);
    }

    /// Move all in-flight writes back to dirty after a connection drop.
    ///
    /// A dirty entry for the same path is newer and wins.
    pub fn requeue_in_flight(&mut self) {
        let in_flight = std::mem::take(&mut self.in_flight);
        for (path, write) in in_flight {
            self.dirty.entry(path).or_insert(write);
        }
    }

    /// Move one in-flight write back to dirty (its flush never made it
    /// onto the wire).
    ///
    /// A dirty entry for the same path is newer and wins.
    pub fn requeue_path(&mut self, path: &str) {
        if let Some(write) = self.in_flight.remove(path) {
            self.dirty.entry(path.to_string()).or_insert(write);
        }
    }

    /// Whether a path has a write in either stage.
    pub fn contains(&self, path: &str) -> bool {
        self.dirty.contains_key(path) || self.in_flight.contains_key(path)
    }

    /// The newest unflushed or unacknowledged stamp for a path.
    pub fn stamp_for(&self, path: &str) -> Option<WriteStamp> {
        self.dirty
            .get(path)
            .or_else(|| self.in_flight.get(path))
            .map(|w| w.stamp())
    }

    /// Number of distinct paths with unsettled writes.
    pub fn pending_count(&self) -> usize {
        let mut paths: BTreeSet<&str> = self.dirty.keys().map(String::as_str).collect();
        paths.extend(self.in_flight.keys().map(String::as_str));
        paths.len()
    }

    /// Number of dirty paths awaiting flush.
    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Number of in-flight paths awaiting acknowledgement.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether both stages are empty.
    pub fn is_empty(&self) -> bool {
        self.dirty.is_empty() && self.in_flight.is_empty()
    }

    /// Drop everything (destroy with discard policy).
    pub fn clear(&mut self) {
        self.dirty.clear();
        self.in_flight.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use handover_types::{DeviceId, Timestamp};
    use serde_json::json;

    fn write(path: &str, millis: u64, value: serde_json::Value) -> PendingWrite {
        PendingWrite {
            path: path.into(),
            value: Some(value),
            timestamp: Timestamp::from_millis(millis),
            device_id: DeviceId::from_bytes(&[1; 32]).unwrap(),
            path_existed: false,
        }
    }

    #[test]
    fn repeated_writes_collapse_to_last_value() {
        let mut queue = WriteQueue::new();
        queue.mark_dirty(write("x", 1, json!(1)));
        queue.mark_dirty(write("x", 2, json!(2)));
        queue.mark_dirty(write("x", 3, json!(3)));

        let flushed = queue.take_dirty();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].value, Some(json!(3)));
    }

    #[test]
    fn unrelated_paths_flush_independently() {
        let mut queue = WriteQueue::new();
        queue.mark_dirty(write("a", 1, json!(1)));
        queue.mark_dirty(write("b", 2, json!(2)));

        let flushed = queue.take_path("a").unwrap();
        assert_eq!(flushed.path, "a");
        assert_eq!(queue.dirty_count(), 1);
        assert_eq!(queue.in_flight_count(), 1);
    }

    #[test]
    fn take_dirty_moves_to_in_flight() {
        let mut queue = WriteQueue::new();
        queue.mark_dirty(write("a", 1, json!(1)));

        let flushed = queue.take_dirty();
        assert_eq!(flushed.len(), 1);
        assert_eq!(queue.dirty_count(), 0);
        assert_eq!(queue.in_flight_count(), 1);
        assert_eq!(queue.pending_count(), 1);
    }

    #[test]
    fn ack_clears_matching_stamp() {
        let mut queue = WriteQueue::new();
        let w = write("a", 1, json!(1));
        let stamp = w.stamp();
        queue.mark_dirty(w);
        queue.take_dirty();

        queue.ack("a", stamp);
        assert!(queue.is_empty());
    }

    #[test]
    fn ack_with_old_stamp_keeps_newer_write() {
        let mut queue = WriteQueue::new();
        let old = write("a", 1, json!(1));
        let old_stamp = old.stamp();
        queue.mark_dirty(old);
        queue.take_dirty();

        // A newer write to the same path goes in flight before the ack
        // for the old one arrives.
        queue.mark_dirty(write("a", 2, json!(2)));
        queue.take_dirty();

        queue.ack("a", old_stamp);
        assert_eq!(queue.in_flight_count(), 1);
    }

    #[test]
    fn requeue_in_flight_on_reconnect() {
        let mut queue = WriteQueue::new();
        queue.mark_dirty(write("a", 1, json!(1)));
        queue.mark_dirty(write("b", 2, json!(2)));
        queue.take_dirty();
        assert_eq!(queue.dirty_count(), 0);

        queue.requeue_in_flight();
        assert_eq!(queue.dirty_count(), 2);
        assert_eq!(queue.in_flight_count(), 0);
    }

    #[test]
    fn requeue_does_not_clobber_newer_dirty_write() {
        let mut queue = WriteQueue::new();
        queue.mark_dirty(write("a", 1, json!("old")));
        queue.take_dirty();

        queue.mark_dirty(write("a", 2, json!("new")));
        queue.requeue_in_flight();

        let flushed = queue.take_dirty();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].value, Some(json!("new")));
    }

    #[test]
    fn requeue_path_returns_single_write_to_dirty() {
        let mut queue = WriteQueue::new();
        queue.mark_dirty(write("a", 1, json!(1)));
        queue.mark_dirty(write("b", 2, json!(2)));
        queue.take_dirty();

        queue.requeue_path("a");
        assert_eq!(queue.dirty_count(), 1);
        assert_eq!(queue.in_flight_count(), 1);
        assert!(queue.take_path("a").is_some());
    }

    #[test]
    fn pending_count_dedupes_paths() {
        let mut queue = WriteQueue::new();
        queue.mark_dirty(write("a", 1, json!(1)));
        queue.take_dirty();
        queue.mark_dirty(write("a", 2, json!(2)));

        // "a" is both in flight and dirty - one path.
        assert_eq!(queue.pending_count(), 1);
    }

    #[test]
    fn discard_drops_both_stages() {
        let mut queue = WriteQueue::new();
        queue.mark_dirty(write("a", 1, json!(1)));
        queue.take_dirty();
        queue.mark_dirty(write("a", 2, json!(2)));

        queue.discard("a");
        assert!(queue.is_empty());
    }

    #[test]
    fn clear_removes_all() {
        let mut queue = WriteQueue::new();
        queue.mark_dirty(write("a", 1, json!(1)));
        queue.mark_dirty(write("b", 2, json!(2)));
        queue.take_path("a");

        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.pending_count(), 0);
    }
}
