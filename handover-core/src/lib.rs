//! # handover-core
//!
//! Pure logic for Handover (no I/O, instant tests).
//!
//! This crate implements the state machines and algorithms for session
//! sync without any network or disk I/O, enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce
//! output without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (network, disk, timers) is performed by
//! `handover-client`, which interprets the actions produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod handoff;
pub mod presence;
pub mod queue;
pub mod resolver;
pub mod state;
pub mod tree;

pub use handoff::{HandoffError, HandoffPayload, HandoffToken, TokenLedger, DEFAULT_HANDOFF_TTL};
pub use presence::{PresenceChange, PresenceError, PresenceSet};
pub use queue::WriteQueue;
pub use resolver::{Resolution, Resolver};
pub use state::{Action, ConnectionState, EngineEvent, Event, ReconnectPolicy};
pub use tree::StateTree;
