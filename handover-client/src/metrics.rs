//! Engine counters and diagnostics.
//!
//! Lock-free counters the engine bumps on its hot paths, plus a
//! [`DiagnosticSnapshot`] for surfacing them to a debug screen or a
//! support log. Counters are cumulative for the engine's lifetime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Cumulative engine metrics.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Local writes accepted.
    writes_total: AtomicU64,
    /// Remote deltas applied to the tree.
    deltas_applied_total: AtomicU64,
    /// Remote deltas dropped as stale.
    deltas_stale_total: AtomicU64,
    /// Remote deltas parked behind pending local writes.
    deltas_deferred_total: AtomicU64,
    /// Flushes sent to the server.
    flushes_total: AtomicU64,
    /// Successful reconnects.
    reconnects_total: AtomicU64,
    /// Heartbeats sent.
    heartbeats_sent_total: AtomicU64,
    /// Heartbeats that timed out without an ack.
    heartbeats_missed_total: AtomicU64,
    /// Envelopes received, well-formed or not.
    messages_received_total: AtomicU64,
    /// Envelopes dropped because they did not decode.
    malformed_messages_total: AtomicU64,

    /// Total microseconds spent serializing the tree for persistence.
    serialize_micros_total: AtomicU64,
    /// Number of persistence serializations.
    serialize_count: AtomicU64,
    /// Largest approximate tree size observed, in bytes.
    tree_size_high_water: AtomicU64,
}

impl EngineMetrics {
    /// Create zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a local write.
    pub fn record_write(&self) {
        self.writes_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an applied remote delta.
    pub fn record_delta_applied(&self) {
        self.deltas_applied_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a stale remote delta.
    pub fn record_delta_stale(&self) {
        self.deltas_stale_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a deferred remote delta.
    pub fn record_delta_deferred(&self) {
        self.deltas_deferred_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a flush.
    pub fn record_flush(&self) {
        self.flushes_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a successful reconnect.
    pub fn record_reconnect(&self) {
        self.reconnects_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a heartbeat send.
    pub fn record_heartbeat_sent(&self) {
        self.heartbeats_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a missed heartbeat ack.
    pub fn record_heartbeat_missed(&self) {
        self.heartbeats_missed_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a received envelope.
    pub fn record_message_received(&self) {
        self.messages_received_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a malformed envelope.
    pub fn record_malformed_message(&self) {
        self.malformed_messages_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one persistence serialization.
    pub fn record_serialize(&self, elapsed: Duration) {
        self.serialize_micros_total
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.serialize_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the tree size after a mutation, keeping the high-water mark.
    pub fn record_tree_size(&self, bytes: usize) {
        self.tree_size_high_water
            .fetch_max(bytes as u64, Ordering::Relaxed);
    }

    /// Snapshot every counter at once.
    pub fn snapshot(&self) -> DiagnosticSnapshot {
        let count = self.serialize_count.load(Ordering::Relaxed);
        let micros = self.serialize_micros_total.load(Ordering::Relaxed);
        DiagnosticSnapshot {
            writes_total: self.writes_total.load(Ordering::Relaxed),
            deltas_applied_total: self.deltas_applied_total.load(Ordering::Relaxed),
            deltas_stale_total: self.deltas_stale_total.load(Ordering::Relaxed),
            deltas_deferred_total: self.deltas_deferred_total.load(Ordering::Relaxed),
            flushes_total: self.flushes_total.load(Ordering::Relaxed),
            reconnects_total: self.reconnects_total.load(Ordering::Relaxed),
            heartbeats_sent_total: self.heartbeats_sent_total.load(Ordering::Relaxed),
            heartbeats_missed_total: self.heartbeats_missed_total.load(Ordering::Relaxed),
            messages_received_total: self.messages_received_total.load(Ordering::Relaxed),
            malformed_messages_total: self.malformed_messages_total.load(Ordering::Relaxed),
            avg_serialize_micros: if count == 0 { 0 } else { micros / count },
            tree_size_high_water_bytes: self.tree_size_high_water.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of the engine counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticSnapshot {
    /// Local writes accepted.
    pub writes_total: u64,
    /// Remote deltas applied.
    pub deltas_applied_total: u64,
    /// Remote deltas dropped as stale.
    pub deltas_stale_total: u64,
    /// Remote deltas deferred.
    pub deltas_deferred_total: u64,
    /// Flushes sent.
    pub flushes_total: u64,
    /// Successful reconnects.
    pub reconnects_total: u64,
    /// Heartbeats sent.
    pub heartbeats_sent_total: u64,
    /// Heartbeat acks missed.
    pub heartbeats_missed_total: u64,
    /// Envelopes received.
    pub messages_received_total: u64,
    /// Envelopes dropped as malformed.
    pub malformed_messages_total: u64,
    /// Mean persistence serialization time in microseconds.
    pub avg_serialize_micros: u64,
    /// Largest approximate tree size seen, in bytes.
    pub tree_size_high_water_bytes: u64,
}
