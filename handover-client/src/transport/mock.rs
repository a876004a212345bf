//! In-process transport for tests.
//!
//! The test plays the server: it queues envelopes for the engine to
//! receive and inspects the envelopes the engine wrote. Fault queues
//! make the next dial, write, or read fail; `sever()` simulates the
//! network dropping without a close handshake.

use super::{Transport, TransportError};
use async_trait::async_trait;
use handover_types::Envelope;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Mock transport for driving a [`SessionEngine`] without a network.
///
/// Clones share the link, so a test holds one handle while the engine
/// holds another.
///
/// [`SessionEngine`]: crate::SessionEngine
#[derive(Debug, Default)]
pub struct MockTransport {
    link: Arc<Mutex<Link>>,
}

#[derive(Debug, Default)]
struct Link {
    up: bool,
    endpoint: Option<String>,
    dials: u32,
    /// Frames the engine wrote, oldest first.
    outbound: Vec<Vec<u8>>,
    /// Frames waiting for the engine's next `recv()`.
    inbound: VecDeque<Vec<u8>>,
    dial_faults: VecDeque<String>,
    write_faults: VecDeque<String>,
    read_faults: VecDeque<String>,
}

impl MockTransport {
    /// Create a disconnected mock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a server envelope for the engine's next `recv()`.
    pub fn queue_envelope(&self, envelope: &Envelope) {
        let frame = envelope.to_bytes().expect("envelope encodes");
        self.link.lock().unwrap().inbound.push_back(frame);
    }

    /// Queue a raw frame, bypassing envelope encoding. For feeding the
    /// engine corrupt input.
    pub fn queue_frame(&self, frame: Vec<u8>) {
        self.link.lock().unwrap().inbound.push_back(frame);
    }

    /// Every frame the engine wrote, oldest first.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.link.lock().unwrap().outbound.clone()
    }

    /// Every envelope the engine wrote, oldest first. Frames that do
    /// not decode are skipped.
    pub fn sent_envelopes(&self) -> Vec<Envelope> {
        self.link
            .lock()
            .unwrap()
            .outbound
            .iter()
            .filter_map(|frame| Envelope::from_bytes(frame).ok())
            .collect()
    }

    /// The most recent envelope the engine wrote.
    pub fn last_envelope(&self) -> Option<Envelope> {
        let link = self.link.lock().unwrap();
        link.outbound
            .iter()
            .rev()
            .find_map(|frame| Envelope::from_bytes(frame).ok())
    }

    /// Forget captured outbound frames (keeps the link up).
    pub fn clear_sent(&self) {
        self.link.lock().unwrap().outbound.clear();
    }

    /// The address the engine dialed.
    pub fn endpoint(&self) -> Option<String> {
        self.link.lock().unwrap().endpoint.clone()
    }

    /// How many dials succeeded (reconnect verification).
    pub fn dial_count(&self) -> u32 {
        self.link.lock().unwrap().dials
    }

    /// Queue a dial failure. Each call fails one future `connect()`.
    pub fn fail_next_dial(&self, reason: &str) {
        self.link.lock().unwrap().dial_faults.push_back(reason.to_string());
    }

    /// Queue a write failure for one future `send()`.
    pub fn fail_next_write(&self, reason: &str) {
        self.link.lock().unwrap().write_faults.push_back(reason.to_string());
    }

    /// Queue a read failure for one future `recv()`.
    pub fn fail_next_read(&self, reason: &str) {
        self.link.lock().unwrap().read_faults.push_back(reason.to_string());
    }

    /// Drop the link without a close handshake, as a network partition
    /// would.
    pub fn sever(&self) {
        self.link.lock().unwrap().up = false;
    }

    /// Clear all state (frames, faults, link).
    pub fn reset(&self) {
        *self.link.lock().unwrap() = Link::default();
    }
}

impl Clone for MockTransport {
    fn clone(&self) -> Self {
        Self {
            link: Arc::clone(&self.link),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, address: &str) -> Result<(), TransportError> {
        let mut link = self.link.lock().unwrap();
        if let Some(reason) = link.dial_faults.pop_front() {
            return Err(TransportError::Dial(reason));
        }
        link.up = true;
        link.endpoint = Some(address.to_string());
        link.dials += 1;
        Ok(())
    }

    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        let mut link = self.link.lock().unwrap();
        if !link.up {
            return Err(TransportError::Disconnected);
        }
        if let Some(reason) = link.write_faults.pop_front() {
            return Err(TransportError::WriteFailed(reason));
        }
        link.outbound.push(frame.to_vec());
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut link = self.link.lock().unwrap();
        if !link.up {
            return Err(TransportError::Disconnected);
        }
        if let Some(reason) = link.read_faults.pop_front() {
            return Err(TransportError::ReadFailed(reason));
        }
        link.inbound.pop_front().ok_or(TransportError::Closed)
    }

    fn is_connected(&self) -> bool {
        self.link.lock().unwrap().up
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.link.lock().unwrap().up = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use handover_types::{DeviceId, MessageType, SessionId};

    fn envelope(msg_type: MessageType) -> Envelope {
        Envelope::new(msg_type, DeviceId::random(), SessionId::new(), vec![1, 2, 3])
    }

    #[tokio::test]
    async fn dial_records_endpoint_and_count() {
        let transport = MockTransport::new();
        assert!(!transport.is_connected());

        transport.connect("sync.test:443").await.unwrap();

        assert!(transport.is_connected());
        assert_eq!(transport.endpoint(), Some("sync.test:443".to_string()));
        assert_eq!(transport.dial_count(), 1);
    }

    #[tokio::test]
    async fn captures_sent_envelopes_in_order() {
        let transport = MockTransport::new();
        transport.connect("a").await.unwrap();

        let first = envelope(MessageType::Heartbeat);
        let second = envelope(MessageType::Subscribe);
        transport.send(&first.to_bytes().unwrap()).await.unwrap();
        transport.send(&second.to_bytes().unwrap()).await.unwrap();

        let sent = transport.sent_envelopes();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].msg_type, MessageType::Heartbeat as u8);
        assert_eq!(
            transport.last_envelope().unwrap().msg_type,
            MessageType::Subscribe as u8
        );
    }

    #[tokio::test]
    async fn delivers_queued_envelopes_in_order() {
        let transport = MockTransport::new();
        transport.connect("a").await.unwrap();

        transport.queue_envelope(&envelope(MessageType::StateSync));
        transport.queue_envelope(&envelope(MessageType::StateDelta));

        let first = Envelope::from_bytes(&transport.recv().await.unwrap()).unwrap();
        let second = Envelope::from_bytes(&transport.recv().await.unwrap()).unwrap();
        assert_eq!(first.msg_type, MessageType::StateSync as u8);
        assert_eq!(second.msg_type, MessageType::StateDelta as u8);
    }

    #[tokio::test]
    async fn raw_frames_pass_through_undecoded() {
        let transport = MockTransport::new();
        transport.connect("a").await.unwrap();

        transport.queue_frame(vec![0xFF, 0x00]);
        assert_eq!(transport.recv().await.unwrap(), vec![0xFF, 0x00]);
    }

    #[tokio::test]
    async fn drained_queue_reports_peer_close() {
        let transport = MockTransport::new();
        transport.connect("a").await.unwrap();

        assert!(matches!(
            transport.recv().await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn send_and_recv_need_an_open_link() {
        let transport = MockTransport::new();

        assert!(matches!(
            transport.send(b"x").await,
            Err(TransportError::Disconnected)
        ));
        assert!(matches!(
            transport.recv().await,
            Err(TransportError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn queued_faults_fire_once_each() {
        let transport = MockTransport::new();
        transport.fail_next_dial("unreachable");
        assert!(matches!(
            transport.connect("a").await,
            Err(TransportError::Dial(_))
        ));
        transport.connect("a").await.unwrap();

        transport.fail_next_write("pipe broken");
        assert!(matches!(
            transport.send(b"x").await,
            Err(TransportError::WriteFailed(_))
        ));
        transport.send(b"x").await.unwrap();

        transport.queue_frame(b"data".to_vec());
        transport.fail_next_read("reset");
        assert!(matches!(
            transport.recv().await,
            Err(TransportError::ReadFailed(_))
        ));
        assert_eq!(transport.recv().await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn queued_dial_faults_accumulate() {
        let transport = MockTransport::new();
        transport.fail_next_dial("first");
        transport.fail_next_dial("second");

        assert!(transport.connect("a").await.is_err());
        assert!(transport.connect("a").await.is_err());
        transport.connect("a").await.unwrap();
        assert_eq!(transport.dial_count(), 1);
    }

    #[tokio::test]
    async fn clones_share_the_link() {
        let a = MockTransport::new();
        let b = a.clone();

        a.connect("node").await.unwrap();
        assert!(b.is_connected());

        a.send(b"from a").await.unwrap();
        b.send(b"from b").await.unwrap();
        assert_eq!(a.sent_frames().len(), 2);
    }

    #[tokio::test]
    async fn sever_simulates_network_loss() {
        let transport = MockTransport::new();
        transport.connect("a").await.unwrap();

        transport.sever();

        assert!(!transport.is_connected());
        assert!(matches!(
            transport.send(b"x").await,
            Err(TransportError::Disconnected)
        ));
        // A redial works and bumps the counter.
        transport.connect("a").await.unwrap();
        assert_eq!(transport.dial_count(), 2);
    }

    #[tokio::test]
    async fn reset_clears_everything() {
        let transport = MockTransport::new();
        transport.connect("a").await.unwrap();
        transport.send(b"x").await.unwrap();
        transport.queue_frame(b"y".to_vec());

        transport.reset();

        assert!(!transport.is_connected());
        assert!(transport.sent_frames().is_empty());
        assert!(transport.endpoint().is_none());
    }
}
