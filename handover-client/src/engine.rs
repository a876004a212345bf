//! SessionEngine - the main interface for Handover.
//!
//! The engine owns one device's replica of a session: the state tree,
//! the write queue, the conflict resolver, presence, and the
//! connection lifecycle. Protocol decisions live in `handover-core` as
//! pure state machines; this module interprets them and performs the
//! actual I/O through the [`Transport`] trait.
//!
//! ```text
//! Application → SessionEngine → Transport → Network
//!                    ↓
//!              handover-core (pure logic)
//! ```
//!
//! The engine is method-driven: `connect()` performs the handshake,
//! `recv_one()` processes one inbound envelope, `heartbeat()` and
//! `check_heartbeat()` drive liveness, `reconnect()` walks the backoff
//! schedule. A thin platform shell loops over these; tests drive them
//! deterministically against a [`MockTransport`](crate::MockTransport).

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use handover_core::state::calculate_backoff;
use handover_core::{
    ConnectionState, EngineEvent, Event as CoreEvent, HandoffPayload, HandoffToken, PresenceChange,
    PresenceError, PresenceSet, Resolution, Resolver, StateTree, TokenLedger, WriteQueue,
};
use handover_core::state::Action;
use handover_types::{
    Auth, Delta, DeviceId, DeviceLeft, DeviceRecord, ErrorCode, ErrorNotice, Envelope, Heartbeat,
    HeartbeatAck, LeaveReason, Message, MessageType, PendingWrite, Session, SessionId, StateDelta,
    Subscribe, SyncError, Timestamp, TokenId, Unsubscribe,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::auth::{AuthError, AuthProvider};
use crate::config::EngineConfig;
use crate::metrics::EngineMetrics;
use crate::storage::KvStorage;
use crate::transport::{Transport, TransportError};

/// Storage key for the persisted state tree.
const TREE_KEY: &str = "handover/state-tree";

/// Engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Token acquisition failed.
    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    /// Protocol-level failure.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Presence rule violated.
    #[error("presence error: {0}")]
    Presence(#[from] PresenceError),

    /// Unexpected message during a handshake.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The engine was destroyed.
    #[error("engine destroyed")]
    Destroyed,
}

/// Events surfaced to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Connected, authenticated, and subscribed.
    Opened,
    /// A connection attempt failed; a retry is scheduled.
    ConnectAttemptFailed {
        /// Which attempt this was.
        attempt: u32,
        /// Error message describing the failure.
        error: String,
    },
    /// The connection dropped; the engine will reconnect.
    Disconnected {
        /// Reason for the drop.
        reason: String,
    },
    /// Every reconnect attempt failed. The connection is dead.
    ReconnectExhausted {
        /// How many attempts were made.
        attempts: u32,
    },
    /// A background flush failed before reaching the wire. The writes
    /// stay queued; the application flow is not interrupted.
    SyncFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// A presence change in the session roster.
    Presence(PresenceChange),
    /// This device was kicked by the primary. Terminal.
    Kicked,
    /// The session expired server-side. Terminal.
    SessionExpired,
    /// The engine was destroyed.
    Destroyed,
}

/// Handle for a state subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type StateCallback = Arc<dyn Fn(&str, Option<&serde_json::Value>) + Send + Sync>;

struct Subscribers {
    next_id: u64,
    // Registration order is notification order.
    entries: Vec<(u64, String, StateCallback)>,
}

impl Subscribers {
    /// Callbacks watching `path`, in registration order. The empty
    /// prefix watches every path.
    fn watchers(&self, path: &str) -> Vec<StateCallback> {
        self.entries
            .iter()
            .filter(|(_, prefix, _)| {
                prefix.is_empty()
                    || path == prefix
                    || path.starts_with(&format!("{}.", prefix))
            })
            .map(|(_, _, callback)| Arc::clone(callback))
            .collect()
    }
}

struct PendingProbe {
    seq: u64,
    sent_at: Instant,
}

struct EngineInner<T> {
    config: EngineConfig,
    transport: T,
    auth: Arc<dyn AuthProvider>,
    storage: Arc<dyn KvStorage>,
    device_id: DeviceId,

    state: Mutex<ConnectionState>,
    session: Mutex<Option<Session>>,
    // Session id used in envelopes before AuthSuccess (a handoff redeem
    // pre-seeds it so the server can route the Auth).
    session_ref: Mutex<SessionId>,

    tree: Mutex<StateTree>,
    resolver: Mutex<Resolver>,
    queue: Mutex<WriteQueue>,
    presence: Mutex<PresenceSet>,
    ledger: Mutex<TokenLedger>,
    subscribers: Mutex<Subscribers>,
    debounce: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,

    heartbeat_seq: AtomicU64,
    pending_probe: Mutex<Option<PendingProbe>>,
    hydrated: AtomicBool,

    metrics: EngineMetrics,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
}

/// The session engine. Cheap to clone; clones share all state.
pub struct SessionEngine<T: Transport + 'static> {
    inner: Arc<EngineInner<T>>,
}

impl<T: Transport + 'static> Clone for SessionEngine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport + 'static> SessionEngine<T> {
    /// Create a new engine. The device identity is minted here and
    /// lives as long as the engine.
    pub fn new(
        config: EngineConfig,
        transport: T,
        auth: Arc<dyn AuthProvider>,
        storage: Arc<dyn KvStorage>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(EngineInner {
                config,
                transport,
                auth,
                storage,
                device_id: DeviceId::random(),
                state: Mutex::new(ConnectionState::new()),
                session: Mutex::new(None),
                session_ref: Mutex::new(SessionId::new()),
                tree: Mutex::new(StateTree::new()),
                resolver: Mutex::new(Resolver::new()),
                queue: Mutex::new(WriteQueue::new()),
                presence: Mutex::new(PresenceSet::new()),
                ledger: Mutex::new(TokenLedger::new()),
                subscribers: Mutex::new(Subscribers {
                    next_id: 0,
                    entries: Vec::new(),
                }),
                debounce: Mutex::new(HashMap::new()),
                heartbeat_seq: AtomicU64::new(0),
                pending_probe: Mutex::new(None),
                hydrated: AtomicBool::new(false),
                metrics: EngineMetrics::new(),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }),
        }
    }

    /// This device's identity.
    pub fn device_id(&self) -> DeviceId {
        self.inner.device_id
    }

    /// The authenticated session, if any.
    pub fn session(&self) -> Option<Session> {
        self.inner.session.lock().unwrap().clone()
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.lock().unwrap().clone()
    }

    /// Take the event stream. Returns `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.inner.events_rx.lock().unwrap().take()
    }

    /// Engine counters.
    pub fn metrics(&self) -> &EngineMetrics {
        &self.inner.metrics
    }

    /// Number of paths with unflushed or unacknowledged writes.
    pub fn pending_writes(&self) -> usize {
        self.inner.queue.lock().unwrap().pending_count()
    }

    /// Current device roster.
    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.inner.presence.lock().unwrap().devices().cloned().collect()
    }

    /// Whether this device is the session's primary.
    pub fn is_primary(&self) -> bool {
        self.inner
            .presence
            .lock()
            .unwrap()
            .primary()
            .map(|d| d.device_id)
            == Some(self.inner.device_id)
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Connect: dial, authenticate, subscribe, and seed the tree from
    /// the server's StateSync. Pending local writes survive the seed
    /// and are flushed once the connection is open.
    pub async fn connect(&self) -> Result<(), EngineError> {
        {
            let state = self.inner.state.lock().unwrap();
            if state.is_terminal() {
                return Err(EngineError::Destroyed);
            }
            if state.is_open() {
                return Ok(());
            }
        }

        self.hydrate().await;
        self.apply_core_event(CoreEvent::ConnectRequested);

        match self.dial_and_handshake().await {
            Ok(()) => {
                self.flush().await?;
                Ok(())
            }
            Err(e) => {
                self.fail_attempt(&e);
                Err(e)
            }
        }
    }

    /// Tell the engine the connection dropped (recv loop saw an error).
    /// Moves the state machine into its reconnect schedule.
    pub fn connection_lost(&self, reason: &str) {
        self.apply_core_event(CoreEvent::SocketClosed {
            reason: reason.to_string(),
        });
    }

    /// Walk the reconnect schedule until a dial succeeds or attempts
    /// are exhausted. On success, unacknowledged writes are requeued
    /// and flushed from current state.
    pub async fn reconnect(&self) -> Result<(), EngineError> {
        loop {
            let delay = {
                let state = self.inner.state.lock().unwrap().clone();
                match state {
                    ConnectionState::Reconnecting { attempt } => {
                        calculate_backoff(attempt, &self.inner.config.reconnect_policy())
                    }
                    ConnectionState::Closed { terminal: true } => return Err(EngineError::Destroyed),
                    ConnectionState::Closed { terminal: false } => {
                        return Err(EngineError::Protocol("reconnect attempts exhausted".into()))
                    }
                    ConnectionState::Open => return Ok(()),
                    other => {
                        return Err(EngineError::Protocol(format!(
                            "cannot reconnect from {:?}",
                            other
                        )))
                    }
                }
            };

            tokio::time::sleep(delay).await;
            self.apply_core_event(CoreEvent::RetryTimer);

            match self.dial_and_handshake().await {
                Ok(()) => {
                    {
                        let mut queue = self.inner.queue.lock().unwrap();
                        queue.requeue_in_flight();
                    }
                    self.inner.metrics.record_reconnect();
                    self.flush().await?;
                    return Ok(());
                }
                Err(e) => {
                    debug!(error = %e, "reconnect attempt failed");
                    self.fail_attempt(&e);
                }
            }
        }
    }

    /// Record one failed connection attempt. The handshake leaves the
    /// state machine wherever it got to, which picks the event: a
    /// failure after the socket opened is an auth failure.
    fn fail_attempt(&self, error: &EngineError) {
        let state = self.inner.state.lock().unwrap().clone();
        let event = match state {
            ConnectionState::Authenticating { .. } => CoreEvent::AuthFailed {
                error: error.to_string(),
            },
            ConnectionState::Open => CoreEvent::SocketClosed {
                reason: error.to_string(),
            },
            _ => CoreEvent::SocketFailed {
                error: error.to_string(),
            },
        };
        self.apply_core_event(event);
    }

    async fn dial_and_handshake(&self) -> Result<(), EngineError> {
        let dial = tokio::time::timeout(
            Duration::from_millis(self.inner.config.connect_timeout_ms),
            self.inner.transport.connect(&self.inner.config.endpoint),
        )
        .await;
        match dial {
            Err(_) => return Err(TransportError::DialTimeout.into()),
            Ok(result) => result?,
        }
        self.apply_core_event(CoreEvent::SocketOpened);

        // Auth, with one refresh retry if the server rejects the token.
        let token = self.inner.auth.token().await?;
        self.send_auth(token).await?;
        let session = match self.recv_message_strict().await? {
            Message::AuthSuccess(ok) => ok.session,
            Message::Error(notice) if notice.code == ErrorCode::NotAuthenticated => {
                debug!("token rejected, refreshing");
                let token = self.inner.auth.refresh_token().await?;
                self.send_auth(token).await?;
                match self.recv_message_strict().await? {
                    Message::AuthSuccess(ok) => ok.session,
                    Message::Error(notice) => {
                        return Err(EngineError::Protocol(notice.message));
                    }
                    other => {
                        return Err(EngineError::Protocol(format!(
                            "expected AuthSuccess, got {:?}",
                            other.message_type()
                        )))
                    }
                }
            }
            Message::Error(notice) => {
                return Err(EngineError::Protocol(notice.message));
            }
            other => {
                return Err(EngineError::Protocol(format!(
                    "expected AuthSuccess, got {:?}",
                    other.message_type()
                )))
            }
        };

        let session_id = session.session_id;
        {
            *self.inner.session_ref.lock().unwrap() = session_id;
            *self.inner.session.lock().unwrap() = Some(session);
        }
        self.apply_core_event(CoreEvent::AuthSucceeded);

        self.send_message(&Message::Subscribe(Subscribe { session_id }))
            .await?;

        // The server answers Subscribe with its authoritative tree
        // (roster messages may arrive first).
        loop {
            match self.recv_one().await? {
                Some(MessageType::StateSync) => break,
                Some(_) | None => continue,
            }
        }

        // Fresh connection generation; any probe from the old one is void.
        *self.inner.pending_probe.lock().unwrap() = None;
        Ok(())
    }

    /// Destroy the engine. Idempotent. Depending on configuration,
    /// pending writes are flushed or discarded before teardown.
    pub async fn destroy(&self) -> Result<(), EngineError> {
        {
            let state = self.inner.state.lock().unwrap();
            if state.is_terminal() {
                return Ok(());
            }
        }

        // Stop debounce timers first so nothing flushes mid-teardown.
        {
            let mut tasks = self.inner.debounce.lock().unwrap();
            for (_, handle) in tasks.drain() {
                handle.abort();
            }
        }

        let open = self.inner.state.lock().unwrap().is_open();
        if open && self.inner.config.flush_on_destroy {
            if let Err(e) = self.flush().await {
                warn!(error = %e, "final flush failed during destroy");
            }
            let session_id = *self.inner.session_ref.lock().unwrap();
            if let Err(e) = self
                .send_message(&Message::Unsubscribe(Unsubscribe { session_id }))
                .await
            {
                debug!(error = %e, "unsubscribe failed during destroy");
            }
        }
        if !self.inner.config.flush_on_destroy {
            self.inner.queue.lock().unwrap().clear();
        }

        self.persist().await;
        self.apply_core_event(CoreEvent::DestroyRequested);
        let _ = self.inner.transport.close().await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // State operations
    // ------------------------------------------------------------------

    /// Write a value. Visible to local subscribers immediately; synced
    /// after the debounce window (when auto-sync is on).
    pub async fn set_state(
        &self,
        path: &str,
        value: serde_json::Value,
    ) -> Result<(), EngineError> {
        if self.inner.state.lock().unwrap().is_terminal() {
            return Err(SyncError::StoreClosed.into());
        }

        let path_existed;
        {
            let mut tree = self.inner.tree.lock().unwrap();
            let prev = tree.set(path, value.clone()).map_err(EngineError::Sync)?;
            path_existed = prev.is_some();
            self.inner.metrics.record_tree_size(tree.approx_size_bytes());
        }
        let write = PendingWrite {
            path: path.to_string(),
            value: Some(value.clone()),
            timestamp: Timestamp::now(),
            device_id: self.inner.device_id,
            path_existed,
        };
        {
            let mut resolver = self.inner.resolver.lock().unwrap();
            resolver.record_local(path, write.stamp());
        }
        {
            let mut queue = self.inner.queue.lock().unwrap();
            queue.mark_dirty(write);
        }
        self.inner.metrics.record_write();
        self.notify(path, Some(&value));
        self.persist().await;

        if self.inner.config.auto_sync {
            self.schedule_flush(path);
        }
        Ok(())
    }

    /// Remove a path. A removal syncs like any other write.
    pub async fn remove_state(&self, path: &str) -> Result<(), EngineError> {
        if self.inner.state.lock().unwrap().is_terminal() {
            return Err(SyncError::StoreClosed.into());
        }

        let path_existed;
        {
            let mut tree = self.inner.tree.lock().unwrap();
            handover_core::tree::validate_path(path)?;
            path_existed = tree.remove(path).is_some();
        }
        let write = PendingWrite {
            path: path.to_string(),
            value: None,
            timestamp: Timestamp::now(),
            device_id: self.inner.device_id,
            path_existed,
        };
        {
            let mut resolver = self.inner.resolver.lock().unwrap();
            resolver.record_local(path, write.stamp());
        }
        {
            let mut queue = self.inner.queue.lock().unwrap();
            queue.mark_dirty(write);
        }
        self.inner.metrics.record_write();
        self.notify(path, None);
        self.persist().await;

        if self.inner.config.auto_sync {
            self.schedule_flush(path);
        }
        Ok(())
    }

    /// Read one path.
    pub fn get_state(&self, path: &str) -> Option<serde_json::Value> {
        self.inner.tree.lock().unwrap().get(path).cloned()
    }

    /// Copy of the whole tree.
    pub fn state_snapshot(&self) -> BTreeMap<String, serde_json::Value> {
        self.inner.tree.lock().unwrap().to_map()
    }

    /// Subscribe to changes at a path (and everything beneath it). An
    /// empty path subscribes to every applied change. Callbacks fire in
    /// registration order, for local and remote changes alike.
    pub fn subscribe<F>(&self, path: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&str, Option<&serde_json::Value>) + Send + Sync + 'static,
    {
        let mut subscribers = self.inner.subscribers.lock().unwrap();
        let id = subscribers.next_id;
        subscribers.next_id += 1;
        subscribers
            .entries
            .push((id, path.to_string(), Arc::new(callback)));
        SubscriptionId(id)
    }

    /// Remove a subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subscribers = self.inner.subscribers.lock().unwrap();
        subscribers.entries.retain(|(entry_id, _, _)| *entry_id != id.0);
    }

    /// Flush every dirty write now, regardless of debounce windows.
    /// A no-op while offline; queued writes replay on reconnect.
    pub async fn flush(&self) -> Result<(), EngineError> {
        let writes = {
            if !self.inner.state.lock().unwrap().is_open() {
                return Ok(());
            }
            self.inner.queue.lock().unwrap().take_dirty()
        };
        if writes.is_empty() {
            return Ok(());
        }
        self.send_deltas(writes).await
    }

    async fn flush_one(&self, path: &str) -> Result<(), EngineError> {
        let write = {
            if !self.inner.state.lock().unwrap().is_open() {
                return Ok(());
            }
            self.inner.queue.lock().unwrap().take_path(path)
        };
        match write {
            Some(write) => self.send_deltas(vec![write]).await,
            None => Ok(()),
        }
    }

    async fn send_deltas(&self, writes: Vec<PendingWrite>) -> Result<(), EngineError> {
        let deltas: Vec<Delta> = writes.iter().map(PendingWrite::to_delta).collect();
        match self
            .send_message(&Message::StateDelta(StateDelta { deltas }))
            .await
        {
            Ok(()) => {
                self.inner.metrics.record_flush();
                Ok(())
            }
            // Encoding failures surface as an event, never an error from
            // a write path; the writes return to dirty for a later flush.
            Err(EngineError::Sync(error)) => {
                warn!(error = %error, "delta encoding failed; writes requeued");
                {
                    let mut queue = self.inner.queue.lock().unwrap();
                    for write in &writes {
                        queue.requeue_path(&write.path);
                    }
                }
                self.emit(SessionEvent::SyncFailed {
                    error: error.to_string(),
                });
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn schedule_flush(&self, path: &str) {
        let mut tasks = self.inner.debounce.lock().unwrap();
        if let Some(handle) = tasks.remove(path) {
            handle.abort();
        }
        let engine = self.clone();
        let path = path.to_string();
        let delay = Duration::from_millis(self.inner.config.debounce_ms);
        let key = path.clone();
        tasks.insert(
            key,
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                engine.inner.debounce.lock().unwrap().remove(&path);
                if let Err(e) = engine.flush_one(&path).await {
                    warn!(path = %path, error = %e, "debounced flush failed");
                }
            }),
        );
    }

    // ------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------

    /// Send a liveness probe. The answering ack clears it.
    pub async fn heartbeat(&self) -> Result<(), EngineError> {
        if !self.inner.state.lock().unwrap().is_open() {
            return Ok(());
        }
        let seq = self.inner.heartbeat_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let probe = Heartbeat {
            seq,
            sent_at: Timestamp::now().as_millis(),
        };
        self.send_message(&Message::Heartbeat(probe)).await?;
        *self.inner.pending_probe.lock().unwrap() = Some(PendingProbe {
            seq,
            sent_at: Instant::now(),
        });
        self.inner.metrics.record_heartbeat_sent();
        Ok(())
    }

    /// Check whether an outstanding probe exceeded the timeout. When it
    /// has, the connection is declared dead and the engine moves into
    /// its reconnect schedule; the caller should run [`reconnect`].
    ///
    /// [`reconnect`]: SessionEngine::reconnect
    pub fn check_heartbeat(&self) -> bool {
        let expired = {
            let probe = self.inner.pending_probe.lock().unwrap();
            probe
                .as_ref()
                .map(|p| {
                    p.sent_at.elapsed()
                        > Duration::from_millis(self.inner.config.heartbeat_timeout_ms)
                })
                .unwrap_or(false)
        };
        if expired {
            *self.inner.pending_probe.lock().unwrap() = None;
            self.inner.metrics.record_heartbeat_missed();
            self.apply_core_event(CoreEvent::HeartbeatMissed);
        }
        expired
    }

    // ------------------------------------------------------------------
    // Handoff
    // ------------------------------------------------------------------

    /// Issue a handoff token bundled with a snapshot of the current
    /// tree, encoded for a QR code or deep link.
    pub fn issue_handoff_token(&self) -> Result<(HandoffToken, String), EngineError> {
        let session_id = self
            .inner
            .session
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.session_id)
            .ok_or(SyncError::NotAuthenticated)?;

        let now = Timestamp::now();
        let token = HandoffToken::issue(
            session_id,
            self.inner.device_id,
            now,
            self.inner.config.handoff_token_ttl_ms,
        );
        {
            let mut ledger = self.inner.ledger.lock().unwrap();
            ledger.sweep(now, self.inner.config.handoff_token_ttl_ms);
            ledger.register(token.clone());
        }

        let payload = HandoffPayload {
            token: token.clone(),
            snapshot: self.state_snapshot(),
        };
        let encoded = payload.to_qr_payload().map_err(SyncError::from)?;
        Ok((token, encoded))
    }

    /// Redeem a scanned handoff payload: seed the tree from its
    /// snapshot (local pending writes win) and adopt its session for
    /// the next [`connect`]. Live deltas reconcile anything the
    /// snapshot missed.
    ///
    /// [`connect`]: SessionEngine::connect
    pub async fn redeem_handoff_token(&self, encoded: &str) -> Result<HandoffToken, EngineError> {
        let payload = HandoffPayload::from_qr_payload(encoded).map_err(SyncError::from)?;
        if payload.token.is_expired(Timestamp::now()) {
            return Err(SyncError::HandoffTokenInvalid("handoff token expired".into()).into());
        }

        *self.inner.session_ref.lock().unwrap() = payload.token.session_id;

        let mut changed = Vec::new();
        {
            let queue = self.inner.queue.lock().unwrap();
            let mut tree = self.inner.tree.lock().unwrap();
            for (path, value) in &payload.snapshot {
                if queue.contains(path) {
                    continue;
                }
                let prev = tree.set(path, value.clone()).map_err(EngineError::Sync)?;
                if prev.as_ref() != Some(value) {
                    changed.push((path.clone(), value.clone()));
                }
            }
            self.inner.metrics.record_tree_size(tree.approx_size_bytes());
        }
        for (path, value) in &changed {
            self.notify(path, Some(value));
        }
        tokio::time::timeout(
            Duration::from_millis(self.inner.config.handoff_redeem_timeout_ms),
            self.persist(),
        )
        .await
        .map_err(|_| SyncError::Timeout)?;
        Ok(payload.token)
    }

    /// Validate a redemption request against this (issuing) engine's
    /// ledger. Succeeds exactly once per token; a replay fails with
    /// `HandoffTokenInvalid` no matter how fresh the token looks.
    pub fn approve_handoff_redemption(&self, token_id: &TokenId) -> Result<SessionId, EngineError> {
        let session_id = self
            .inner
            .ledger
            .lock()
            .unwrap()
            .redeem(token_id, Timestamp::now())
            .map_err(SyncError::from)?;
        Ok(session_id)
    }

    /// Kick another device from the session. Primary only; the roster
    /// updates when the server echoes the departure.
    pub async fn kick_device(&self, target: DeviceId) -> Result<(), EngineError> {
        {
            let presence = self.inner.presence.lock().unwrap();
            if presence.primary().map(|d| d.device_id) != Some(self.inner.device_id) {
                return Err(PresenceError::NotPrimary.into());
            }
            if !presence.contains(&target) {
                return Err(PresenceError::UnknownDevice(target).into());
            }
        }
        self.send_message(&Message::DeviceLeft(DeviceLeft {
            device_id: target,
            reason: LeaveReason::Kicked,
        }))
        .await
    }

    // ------------------------------------------------------------------
    // Inbound processing
    // ------------------------------------------------------------------

    /// Receive and process one envelope. Malformed envelopes are
    /// counted, logged, and dropped (`Ok(None)`); transport failures
    /// surface as errors for the caller's reconnect logic.
    pub async fn recv_one(&self) -> Result<Option<MessageType>, EngineError> {
        let bytes = self.inner.transport.recv().await?;
        self.inner.metrics.record_message_received();

        let envelope = match Envelope::from_bytes(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.inner.metrics.record_malformed_message();
                warn!(error = %e, "dropping malformed envelope");
                return Ok(None);
            }
        };
        let message = match Message::from_bytes(&envelope.payload) {
            Ok(message) => message,
            Err(e) => {
                self.inner.metrics.record_malformed_message();
                warn!(error = %e, msg_type = envelope.msg_type, "dropping malformed payload");
                return Ok(None);
            }
        };

        let message_type = message.message_type();
        self.handle_message(message).await?;
        Ok(Some(message_type))
    }

    /// Process envelopes until the transport fails, then report the
    /// connection as lost. Run this from the platform shell's read
    /// loop.
    pub async fn process_incoming(&self) -> Result<(), EngineError> {
        loop {
            match self.recv_one().await {
                Ok(_) => continue,
                Err(EngineError::Transport(e)) => {
                    self.connection_lost(&e.to_string());
                    return Err(e.into());
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn handle_message(&self, message: Message) -> Result<(), EngineError> {
        match message {
            Message::Heartbeat(probe) => {
                // Server-initiated probe; echo it back.
                self.send_message(&Message::HeartbeatAck(HeartbeatAck {
                    seq: probe.seq,
                    sent_at: probe.sent_at,
                }))
                .await?;
            }
            Message::HeartbeatAck(ack) => {
                let mut probe = self.inner.pending_probe.lock().unwrap();
                if probe.as_ref().map(|p| p.seq) == Some(ack.seq) {
                    *probe = None;
                }
            }
            Message::StateDelta(batch) => {
                self.apply_remote_deltas(batch.deltas).await;
            }
            Message::StateSync(sync) => {
                self.seed_tree(sync.tree, false).await?;
            }
            Message::StateUpdate(update) => {
                self.seed_tree(update.tree, true).await?;
            }
            Message::Ack(ack) => {
                let mut resolver = self.inner.resolver.lock().unwrap();
                let mut queue = self.inner.queue.lock().unwrap();
                for entry in ack.entries {
                    resolver.ack_local(&entry.path, entry.stamp);
                    queue.ack(&entry.path, entry.stamp);
                }
            }
            Message::Connected(connected) => {
                let changes = self
                    .inner
                    .presence
                    .lock()
                    .unwrap()
                    .replace_all(connected.devices);
                self.emit_presence(changes);
            }
            Message::DeviceJoined(joined) => {
                let changes = self.inner.presence.lock().unwrap().join(joined.device);
                self.emit_presence(changes);
            }
            Message::DeviceLeft(left) => {
                if left.device_id == self.inner.device_id && left.reason == LeaveReason::Kicked {
                    self.emit(SessionEvent::Kicked);
                    self.terminate().await;
                    return Ok(());
                }
                let changes = self
                    .inner
                    .presence
                    .lock()
                    .unwrap()
                    .leave(left.device_id, left.reason);
                self.emit_presence(changes);
            }
            Message::Error(notice) => {
                self.handle_error_notice(notice).await;
            }
            // Client-to-server messages arriving here mean a confused
            // peer; log and drop.
            other @ (Message::Auth(_)
            | Message::AuthSuccess(_)
            | Message::Subscribe(_)
            | Message::Unsubscribe(_)) => {
                warn!(msg_type = ?other.message_type(), "unexpected message direction");
            }
        }
        Ok(())
    }

    async fn handle_error_notice(&self, notice: ErrorNotice) {
        match notice.code {
            ErrorCode::SessionExpired => {
                warn!("session expired: {}", notice.message);
                self.emit(SessionEvent::SessionExpired);
                self.terminate().await;
            }
            ErrorCode::NotAuthenticated => {
                // Token went bad mid-session; the reconnect handshake
                // refreshes it.
                self.connection_lost(&notice.message);
            }
            ErrorCode::HandoffTokenInvalid | ErrorCode::Internal => {
                warn!(code = ?notice.code, "server error notice: {}", notice.message);
            }
        }
    }

    async fn apply_remote_deltas(&self, deltas: Vec<Delta>) {
        for delta in deltas {
            if delta.origin == self.inner.device_id {
                // Our own write echoed back through the fan-out.
                continue;
            }
            let resolution = self.inner.resolver.lock().unwrap().resolve_remote(&delta);
            match resolution {
                Resolution::Apply => {
                    self.apply_one(&delta);
                    self.inner.metrics.record_delta_applied();
                }
                Resolution::ApplyOverLocal => {
                    {
                        let mut queue = self.inner.queue.lock().unwrap();
                        queue.discard(&delta.path);
                    }
                    if let Some(handle) = self.inner.debounce.lock().unwrap().remove(&delta.path) {
                        handle.abort();
                    }
                    self.apply_one(&delta);
                    self.inner.metrics.record_delta_applied();
                }
                Resolution::Deferred => {
                    self.inner.metrics.record_delta_deferred();
                }
                Resolution::Stale => {
                    self.inner.metrics.record_delta_stale();
                }
            }
        }
        self.persist().await;
    }

    fn apply_one(&self, delta: &Delta) {
        let applied = {
            let mut tree = self.inner.tree.lock().unwrap();
            let result = tree.apply(delta);
            self.inner.metrics.record_tree_size(tree.approx_size_bytes());
            result
        };
        match applied {
            Ok(value) => self.notify(&delta.path, value.as_ref()),
            Err(e) => warn!(path = %delta.path, error = %e, "delta did not apply"),
        }
    }

    /// Seed the tree from a server-known map. Paths with pending local
    /// writes keep the local value. When `replace` is set, paths absent
    /// from the map (and not locally pending) are removed.
    async fn seed_tree(
        &self,
        map: BTreeMap<String, serde_json::Value>,
        replace: bool,
    ) -> Result<(), EngineError> {
        let mut changed: Vec<(String, Option<serde_json::Value>)> = Vec::new();
        {
            let queue = self.inner.queue.lock().unwrap();
            let mut tree = self.inner.tree.lock().unwrap();

            if replace {
                let stale: Vec<String> = tree
                    .as_map()
                    .keys()
                    .filter(|path| !map.contains_key(*path) && !queue.contains(path))
                    .cloned()
                    .collect();
                for path in stale {
                    tree.remove(&path);
                    changed.push((path, None));
                }
            }

            for (path, value) in map {
                if queue.contains(&path) {
                    continue;
                }
                let prev = tree.set(&path, value.clone()).map_err(EngineError::Sync)?;
                if prev.as_ref() != Some(&value) {
                    changed.push((path, Some(value)));
                }
            }
            self.inner.metrics.record_tree_size(tree.approx_size_bytes());
        }
        for (path, value) in &changed {
            self.notify(path, value.as_ref());
        }
        self.persist().await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    async fn send_auth(&self, token: String) -> Result<(), EngineError> {
        self.send_message(&Message::Auth(Auth {
            token,
            device_id: self.inner.device_id,
            display_name: self.inner.config.device_name.clone(),
            platform: self.inner.config.platform,
        }))
        .await
    }

    async fn send_message(&self, message: &Message) -> Result<(), EngineError> {
        let payload = message.to_bytes()?;
        let session_id = *self.inner.session_ref.lock().unwrap();
        let envelope = Envelope::new(
            message.message_type(),
            self.inner.device_id,
            session_id,
            payload,
        );
        self.inner.transport.send(&envelope.to_bytes()?).await?;
        Ok(())
    }

    /// Receive one message for a handshake step; anything undecodable
    /// is a hard error here, not a droppable frame.
    async fn recv_message_strict(&self) -> Result<Message, EngineError> {
        let bytes = self.inner.transport.recv().await?;
        let envelope = Envelope::from_bytes(&bytes)?;
        Ok(Message::from_bytes(&envelope.payload)?)
    }

    async fn hydrate(&self) {
        if self.inner.hydrated.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.inner.storage.get(TREE_KEY).await {
            Ok(Some(bytes)) => match StateTree::from_json_bytes(&bytes) {
                Ok(tree) => {
                    debug!(paths = tree.len(), "hydrated state tree from storage");
                    *self.inner.tree.lock().unwrap() = tree;
                }
                Err(e) => warn!(error = %e, "persisted tree corrupt, cold start"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "storage read failed, cold start"),
        }
    }

    async fn persist(&self) {
        let encoded = {
            let tree = self.inner.tree.lock().unwrap();
            let start = Instant::now();
            let result = tree.to_json_bytes();
            (result, start.elapsed())
        };
        match encoded {
            (Ok(bytes), elapsed) => {
                self.inner.metrics.record_serialize(elapsed);
                if let Err(e) = self.inner.storage.set(TREE_KEY, bytes).await {
                    warn!(error = %e, "tree persistence failed");
                }
            }
            (Err(e), _) => warn!(error = %e, "tree serialization failed"),
        }
    }

    async fn terminate(&self) {
        {
            let mut tasks = self.inner.debounce.lock().unwrap();
            for (_, handle) in tasks.drain() {
                handle.abort();
            }
        }
        self.apply_core_event(CoreEvent::DestroyRequested);
        let _ = self.inner.transport.close().await;
    }

    fn apply_core_event(&self, event: CoreEvent) {
        let actions = {
            let mut state = self.inner.state.lock().unwrap();
            let (next, actions) = state
                .clone()
                .on_event(event, &self.inner.config.reconnect_policy());
            *state = next;
            actions
        };
        for action in actions {
            if let Action::EmitEvent(event) = action {
                self.emit(match event {
                    EngineEvent::Opened => SessionEvent::Opened,
                    EngineEvent::ConnectionFailed { attempt, error } => {
                        SessionEvent::ConnectAttemptFailed { attempt, error }
                    }
                    EngineEvent::Disconnected { reason } => SessionEvent::Disconnected { reason },
                    EngineEvent::ReconnectExhausted { attempts, .. } => {
                        SessionEvent::ReconnectExhausted { attempts }
                    }
                    EngineEvent::Destroyed => SessionEvent::Destroyed,
                });
            }
            // Dial, SendAuth, SendSubscribe, timers: performed
            // explicitly by connect()/reconnect()/the shell's timers.
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.inner.events_tx.send(event);
    }

    fn emit_presence(&self, changes: Vec<PresenceChange>) {
        for change in changes {
            self.emit(SessionEvent::Presence(change));
        }
    }

    fn notify(&self, path: &str, value: Option<&serde_json::Value>) {
        // The registry lock is released before any callback runs, so a
        // callback may subscribe or unsubscribe.
        let watchers = self.inner.subscribers.lock().unwrap().watchers(path);
        for callback in watchers {
            callback(path, value);
        }
    }
}

impl<T: Transport + 'static> std::fmt::Debug for SessionEngine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEngine")
            .field("device_id", &self.inner.device_id)
            .field("state", &*self.inner.state.lock().unwrap())
            .field("pending_writes", &self.pending_writes())
            .finish()
    }
}
