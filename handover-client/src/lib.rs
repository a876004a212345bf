//! # handover-client
//!
//! The async session engine for Handover: multi-device session state
//! sync with last-write-wins reconciliation, presence, and device
//! handoff.
//!
//! # Architecture
//!
//! [`SessionEngine`] is the application-facing API. Protocol decisions
//! (connection lifecycle, write precedence, presence, handoff tokens)
//! live in `handover-core` as pure logic; this crate performs the I/O
//! around them:
//!
//! - [`Transport`] - pluggable byte transport ([`MockTransport`] for tests)
//! - [`KvStorage`] - local persistence for warm starts
//! - [`AuthProvider`] - bearer token supply and refresh
//! - [`SnapshotApi`] - the service's REST surface for snapshots
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use handover_client::{EngineConfig, MemoryStorage, SessionEngine, StaticAuth};
//!
//! let config = EngineConfig::new("sync.example.com:443")
//!     .with_device_name("Alex's phone");
//! let engine = SessionEngine::new(
//!     config,
//!     transport,
//!     Arc::new(StaticAuth::new(bearer_token)),
//!     Arc::new(MemoryStorage::new()),
//! );
//!
//! engine.connect().await?;
//! engine.set_state("cart.items", serde_json::json!([1, 2, 3])).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod config;
pub mod engine;
pub mod metrics;
pub mod snapshot;
pub mod storage;
pub mod transport;

pub use auth::{AuthError, AuthProvider, StaticAuth};
pub use config::EngineConfig;
pub use engine::{EngineError, SessionEngine, SessionEvent, SubscriptionId};
pub use metrics::{DiagnosticSnapshot, EngineMetrics};
pub use snapshot::{ApiError, HttpSnapshotApi, SnapshotApi};
pub use storage::{KvStorage, MemoryStorage, StorageError};
pub use transport::{MockTransport, Transport, TransportError};
