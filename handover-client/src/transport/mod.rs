//! Transport abstraction for the session engine.
//!
//! A pluggable, connection-oriented frame transport. The engine speaks
//! envelopes; the transport moves one encoded envelope per frame, so a
//! WebSocket, QUIC stream, or in-process mock all plug in behind the
//! same trait. Frames stay opaque bytes at this layer: a corrupt frame
//! must reach the engine, which counts and drops it.
//!
//! # Example
//!
//! ```ignore
//! let transport = MockTransport::new();
//! transport.connect("sync.example.com:443").await?;
//! transport.send(&envelope.to_bytes()?).await?;
//! let frame = transport.recv().await?;
//! ```

mod mock;

pub use mock::MockTransport;

use async_trait::async_trait;
use thiserror::Error;

/// Ways the connection to the sync endpoint can fail.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The dial never produced a connection (refused, unreachable,
    /// TLS failure).
    #[error("dial failed: {0}")]
    Dial(String),

    /// The dial exceeded its deadline.
    #[error("dial timed out")]
    DialTimeout,

    /// The operation needs an open connection and there is none.
    #[error("no open connection")]
    Disconnected,

    /// The peer closed the connection; no more frames will arrive.
    #[error("connection closed by peer")]
    Closed,

    /// A frame could not be written.
    #[error("frame write failed: {0}")]
    WriteFailed(String),

    /// A frame could not be read.
    #[error("frame read failed: {0}")]
    ReadFailed(String),
}

/// Frame transport carrying encoded protocol envelopes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the sync endpoint at the given address.
    async fn connect(&self, address: &str) -> Result<(), TransportError>;

    /// Write one envelope's encoded bytes as a frame.
    async fn send(&self, frame: &[u8]) -> Result<(), TransportError>;

    /// Read the next frame.
    ///
    /// Blocks until a frame is available or the connection closes.
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;

    /// Check if currently connected.
    fn is_connected(&self) -> bool;

    /// Close the connection gracefully.
    async fn close(&self) -> Result<(), TransportError>;
}
