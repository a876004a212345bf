//! Connection state machine for the transport layer.
//!
//! A pure, side-effect-free state machine for the connection lifecycle:
//! `Closed → Connecting → Authenticating → Open`, with `Reconnecting`
//! holding the backoff bookkeeping. Events go in, a new state plus a
//! list of actions comes out; the client executes the actions.
//!
//! Keeping this pure means the whole lifecycle, including backoff
//! exhaustion and terminal destroy, unit-tests without sockets.

use std::time::Duration;

/// Reconnect policy: exponential backoff with full jitter, bounded
/// attempt count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Base delay for the first retry.
    pub base_delay: Duration,
    /// Cap on the computed delay (before jitter draws under it).
    pub max_delay: Duration,
    /// Attempts allowed before the connection is declared dead.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 8,
        }
    }
}

/// Connection state machine - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection. `terminal` is set after destroy, which permits no
    /// further transitions; otherwise a connect may be requested.
    Closed {
        /// Whether the store was destroyed.
        terminal: bool,
    },
    /// Socket dial in progress.
    Connecting {
        /// Reconnection attempts so far (0 on a fresh connect).
        attempt: u32,
    },
    /// Socket open, Auth sent, awaiting AuthSuccess.
    Authenticating {
        /// Reconnection attempts so far.
        attempt: u32,
    },
    /// Fully connected and subscribed.
    Open,
    /// Waiting out a backoff delay before re-dialing.
    Reconnecting {
        /// Reconnection attempts so far.
        attempt: u32,
    },
}

impl ConnectionState {
    /// Create a new state machine in the (non-terminal) Closed state.
    pub fn new() -> Self {
        Self::Closed { terminal: false }
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function; the caller performs the actual I/O.
    pub fn on_event(self, event: Event, policy: &ReconnectPolicy) -> (Self, Vec<Action>) {
        match (self, event) {
            // Terminal: a destroyed machine ignores everything.
            (state @ Self::Closed { terminal: true }, _) => (state, vec![]),

            // destroy() forces Closed from any state.
            (state, Event::DestroyRequested) => {
                let mut actions = vec![Action::CancelTimers];
                if matches!(state, Self::Open | Self::Authenticating { .. }) {
                    actions.push(Action::CloseSocket);
                }
                actions.push(Action::EmitEvent(EngineEvent::Destroyed));
                (Self::Closed { terminal: true }, actions)
            }

            // From Closed (idle)
            (Self::Closed { terminal: false }, Event::ConnectRequested) => {
                (Self::Connecting { attempt: 0 }, vec![Action::Dial])
            }

            // From Connecting
            (Self::Connecting { attempt }, Event::SocketOpened) => {
                (Self::Authenticating { attempt }, vec![Action::SendAuth])
            }
            (Self::Connecting { attempt }, Event::SocketFailed { error }) => {
                retry(attempt, error, policy)
            }

            // From Authenticating
            (Self::Authenticating { .. }, Event::AuthSucceeded) => (
                Self::Open,
                vec![
                    Action::SendSubscribe,
                    Action::StartHeartbeat,
                    Action::EmitEvent(EngineEvent::Opened),
                ],
            ),
            // Auth failure is fatal for this attempt: back off, never
            // hammer the server with immediate retries.
            (Self::Authenticating { attempt }, Event::AuthFailed { error }) => {
                retry(attempt, error, policy)
            }
            (Self::Authenticating { attempt }, Event::SocketFailed { error }) => {
                retry(attempt, error, policy)
            }

            // From Open
            (Self::Open, Event::SocketClosed { reason }) => disconnect(reason, policy),
            // A missed heartbeat-ack means the connection is dead even
            // if the socket still reports itself open.
            (Self::Open, Event::HeartbeatMissed) => {
                disconnect("heartbeat timeout".into(), policy)
            }

            // From Reconnecting
            (Self::Reconnecting { attempt }, Event::RetryTimer) => {
                (Self::Connecting { attempt }, vec![Action::Dial])
            }
            (Self::Reconnecting { attempt }, Event::SocketFailed { error }) => {
                retry(attempt, error, policy)
            }

            // Invalid transitions - stay in current state.
            (state, _) => (state, vec![]),
        }
    }

    /// Check if the connection is fully open.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Check if a connection attempt is in progress.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            Self::Connecting { .. } | Self::Authenticating { .. } | Self::Reconnecting { .. }
        )
    }

    /// Check if the machine was destroyed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed { terminal: true })
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

fn disconnect(reason: String, policy: &ReconnectPolicy) -> (ConnectionState, Vec<Action>) {
    (
        ConnectionState::Reconnecting { attempt: 1 },
        vec![
            Action::CancelTimers,
            Action::EmitEvent(EngineEvent::Disconnected { reason }),
            Action::StartReconnectTimer {
                delay: calculate_backoff(1, policy),
            },
        ],
    )
}

fn retry(attempt: u32, error: String, policy: &ReconnectPolicy) -> (ConnectionState, Vec<Action>) {
    let next_attempt = attempt.saturating_add(1);
    if next_attempt > policy.max_attempts {
        return (
            ConnectionState::Closed { terminal: false },
            vec![
                Action::CancelTimers,
                Action::EmitEvent(EngineEvent::ReconnectExhausted {
                    attempts: attempt,
                    error,
                }),
            ],
        );
    }
    (
        ConnectionState::Reconnecting {
            attempt: next_attempt,
        },
        vec![
            Action::EmitEvent(EngineEvent::ConnectionFailed {
                attempt: next_attempt,
                error,
            }),
            Action::StartReconnectTimer {
                delay: calculate_backoff(next_attempt, policy),
            },
        ],
    )
}

/// Events that can occur in the connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// User requested connection.
    ConnectRequested,
    /// The underlying socket opened.
    SocketOpened,
    /// The dial or socket failed.
    SocketFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// AuthSuccess arrived.
    AuthSucceeded,
    /// The server rejected the bearer token.
    AuthFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// An open socket dropped.
    SocketClosed {
        /// Reason for the drop.
        reason: String,
    },
    /// No HeartbeatAck within the timeout window.
    HeartbeatMissed,
    /// Reconnect backoff timer fired.
    RetryTimer,
    /// destroy() was called.
    DestroyRequested,
}

/// Actions to be executed by the client.
///
/// These are instructions, not side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Initiate the transport connection.
    Dial,
    /// Send the Auth envelope.
    SendAuth,
    /// Send Subscribe for the session.
    SendSubscribe,
    /// Start the periodic heartbeat.
    StartHeartbeat,
    /// Close the underlying socket.
    CloseSocket,
    /// Start a timer for reconnection.
    StartReconnectTimer {
        /// Delay before attempting reconnection.
        delay: Duration,
    },
    /// Cancel heartbeat and reconnect timers.
    CancelTimers,
    /// Emit an event to the application.
    EmitEvent(EngineEvent),
}

/// Events emitted to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Connected, authenticated, and subscribed.
    Opened,
    /// A connection attempt failed; a retry is scheduled.
    ConnectionFailed {
        /// Which attempt this was.
        attempt: u32,
        /// Error message describing the failure.
        error: String,
    },
    /// The open connection dropped; reconnecting.
    Disconnected {
        /// Reason for the drop.
        reason: String,
    },
    /// All reconnect attempts exhausted. Terminal for this connection.
    ReconnectExhausted {
        /// How many attempts were made.
        attempts: u32,
        /// The last error seen.
        error: String,
    },
    /// The store was destroyed.
    Destroyed,
}

/// Calculate the reconnect delay for an attempt.
///
/// Exponential base capped at `max_delay`, then full jitter: the actual
/// delay is uniform in `0..=base`, which spreads simultaneous
/// reconnects after a server restart.
pub fn calculate_backoff(attempt: u32, policy: &ReconnectPolicy) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let base_ms = (policy.base_delay.as_millis() as u64)
        .saturating_mul(1u64 << shift)
        .min(policy.max_delay.as_millis() as u64);
    Duration::from_millis(random_below(base_ms.saturating_add(1)))
}

/// Uniform random value in `0..bound` (bound >= 1).
fn random_below(bound: u64) -> u64 {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes).expect("getrandom failed");
    u64::from_le_bytes(bytes) % bound
}
