//! In-memory transport for tests and simulation
//!
//! Every [`MockTransport`] owns an inbox channel. Linking two transports
//! hands each the other's inbox sender, so frames arrive in send order.
//! Each transport also keeps a log of the frames it sent, which tests use
//! to assert on exactly what went over the wire.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use concord_core::{MockTransportBuilder, SimulationIdentity, Transport};
//!
//! let a = SimulationIdentity::new('A').unwrap();
//! let b = SimulationIdentity::new('B').unwrap();
//! let (ta, tb) = MockTransportBuilder::new().create_connected_pair(a, b);
//!
//! ta.send(&b, b"ping".to_vec()).await?;
//! let (from, frame) = tb.recv().await?;
//! assert_eq!(from, a);
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::error::TransportError;
use crate::identity::PeerIdentity;
use crate::transport::Transport;

/// Frame travelling between mock transports
#[derive(Debug, Clone)]
pub struct MockFrame<I> {
    /// Transport-supplied sender identity
    pub sender: I,
    /// Frame payload
    pub data: Vec<u8>,
}

/// A mock transport backed by in-memory channels
pub struct MockTransport<I: PeerIdentity> {
    local_id: I,
    /// Outgoing links (peer -> that peer's inbox)
    outgoing: DashMap<I, mpsc::Sender<MockFrame<I>>>,
    inbox_rx: AsyncMutex<mpsc::Receiver<MockFrame<I>>>,
    inbox_tx: mpsc::Sender<MockFrame<I>>,
    /// Frames this transport has sent, in order
    sent: Mutex<Vec<(I, Vec<u8>)>>,
}

impl<I: PeerIdentity> MockTransport<I> {
    /// Create an unlinked mock transport
    pub fn new(local_id: I) -> Self {
        Self::with_buffer_size(local_id, 1024)
    }

    /// Create an unlinked mock transport with a specific inbox capacity
    pub fn with_buffer_size(local_id: I, buffer_size: usize) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(buffer_size);
        Self {
            local_id,
            outgoing: DashMap::new(),
            inbox_rx: AsyncMutex::new(inbox_rx),
            inbox_tx,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Get our local identity
    pub fn local_id(&self) -> &I {
        &self.local_id
    }

    /// Sender half of our inbox, handed to peers that link to us
    pub fn inbox_sender(&self) -> mpsc::Sender<MockFrame<I>> {
        self.inbox_tx.clone()
    }

    /// Add a one-way link to a peer's inbox
    pub fn connect_to(&self, peer_id: I, peer_inbox: mpsc::Sender<MockFrame<I>>) {
        self.outgoing.insert(peer_id, peer_inbox);
    }

    /// Remove the one-way link to a peer
    pub fn disconnect_from(&self, peer: &I) {
        self.outgoing.remove(peer);
    }

    /// Inject a frame into our own inbox as if `sender` had sent it
    pub async fn inject(&self, sender: I, data: Vec<u8>) -> Result<(), TransportError> {
        self.inbox_tx
            .send(MockFrame { sender, data })
            .await
            .map_err(|_| TransportError::SendFailed("inbox closed".into()))
    }

    /// Every frame sent so far, as (recipient, payload)
    pub fn sent_frames(&self) -> Vec<(I, Vec<u8>)> {
        self.sent.lock().clone()
    }

    /// Frames sent so far to one recipient
    pub fn sent_to(&self, peer: &I) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .iter()
            .filter(|(to, _)| to == peer)
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Forget the sent-frame log
    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl<I: PeerIdentity> Transport<I> for MockTransport<I> {
    async fn send(&self, peer: &I, data: Vec<u8>) -> Result<(), TransportError> {
        let sender = self
            .outgoing
            .get(peer)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::PeerNotConnected(peer.short_id()))?;

        self.sent.lock().push((peer.clone(), data.clone()));

        sender
            .send(MockFrame {
                sender: self.local_id.clone(),
                data,
            })
            .await
            .map_err(|_| TransportError::SendFailed("channel closed".into()))
    }

    async fn recv(&self) -> Result<(I, Vec<u8>), TransportError> {
        let mut inbox = self.inbox_rx.lock().await;
        let frame = inbox
            .recv()
            .await
            .ok_or_else(|| TransportError::ReceiveFailed("channel closed".into()))?;
        Ok((frame.sender, frame.data))
    }

    fn is_connected(&self, peer: &I) -> bool {
        self.outgoing.contains_key(peer)
    }

    fn connected_peers(&self) -> Vec<I> {
        self.outgoing.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn try_recv(&self) -> Result<Option<(I, Vec<u8>)>, TransportError> {
        let mut inbox = self.inbox_rx.lock().await;
        match inbox.try_recv() {
            Ok(frame) => Ok(Some((frame.sender, frame.data))),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Err(TransportError::ReceiveFailed("channel disconnected".into()))
            }
        }
    }

    async fn disconnect(&self, peer: &I) -> Result<(), TransportError> {
        self.outgoing.remove(peer);
        Ok(())
    }
}

/// Builder for sets of linked mock transports
pub struct MockTransportBuilder {
    buffer_size: usize,
}

impl Default for MockTransportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransportBuilder {
    /// Create a builder with default inbox capacity
    pub fn new() -> Self {
        Self { buffer_size: 1024 }
    }

    /// Set the inbox capacity for every transport built
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    fn transport<I: PeerIdentity>(&self, id: I) -> MockTransport<I> {
        MockTransport::with_buffer_size(id, self.buffer_size)
    }

    /// Create two transports linked in both directions
    pub fn create_connected_pair<I: PeerIdentity>(
        &self,
        id_a: I,
        id_b: I,
    ) -> (MockTransport<I>, MockTransport<I>) {
        let a = self.transport(id_a);
        let b = self.transport(id_b);
        link(&a, &b);
        (a, b)
    }

    /// Create transports where every pair is linked
    pub fn create_full_mesh<I: PeerIdentity>(&self, ids: Vec<I>) -> HashMap<I, MockTransport<I>> {
        let transports: HashMap<I, MockTransport<I>> = ids
            .iter()
            .map(|id| (id.clone(), self.transport(id.clone())))
            .collect();

        for a in transports.values() {
            for b in transports.values() {
                if a.local_id() != b.local_id() {
                    a.connect_to(b.local_id().clone(), b.inbox_sender());
                }
            }
        }

        transports
    }

    /// Create a star where every spoke is linked only to the hub
    pub fn create_star<I: PeerIdentity>(
        &self,
        hub: I,
        spokes: Vec<I>,
    ) -> HashMap<I, MockTransport<I>> {
        let hub_transport = self.transport(hub.clone());
        let mut transports = HashMap::new();

        for spoke in spokes {
            let spoke_transport = self.transport(spoke.clone());
            link(&hub_transport, &spoke_transport);
            transports.insert(spoke, spoke_transport);
        }

        transports.insert(hub, hub_transport);
        transports
    }
}

fn link<I: PeerIdentity>(a: &MockTransport<I>, b: &MockTransport<I>) {
    a.connect_to(b.local_id().clone(), b.inbox_sender());
    b.connect_to(a.local_id().clone(), a.inbox_sender());
}

/// Shared handles to a set of mock transports, with partition control
pub struct MockNetwork<I: PeerIdentity> {
    transports: HashMap<I, Arc<MockTransport<I>>>,
}

impl<I: PeerIdentity> MockNetwork<I> {
    /// Create a fully linked network
    pub fn full_mesh(ids: Vec<I>) -> Self {
        let transports = MockTransportBuilder::new()
            .create_full_mesh(ids)
            .into_iter()
            .map(|(id, transport)| (id, Arc::new(transport)))
            .collect();
        Self { transports }
    }

    /// Get a transport by identity
    pub fn get(&self, id: &I) -> Option<Arc<MockTransport<I>>> {
        self.transports.get(id).cloned()
    }

    /// Get all identities
    pub fn identities(&self) -> Vec<I> {
        self.transports.keys().cloned().collect()
    }

    /// Cut every link between the two groups
    pub fn partition(&self, group_a: &[I], group_b: &[I]) {
        for a in group_a {
            for b in group_b {
                if let Some(t) = self.transports.get(a) {
                    t.disconnect_from(b);
                }
                if let Some(t) = self.transports.get(b) {
                    t.disconnect_from(a);
                }
            }
        }
    }

    /// Restore every link between the two groups
    pub fn heal(&self, group_a: &[I], group_b: &[I]) {
        for a in group_a {
            for b in group_b {
                if let (Some(ta), Some(tb)) = (self.transports.get(a), self.transports.get(b)) {
                    link(ta, tb);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SimulationIdentity;

    #[tokio::test]
    async fn test_mock_transport_send_recv() {
        let alice = SimulationIdentity::new('A').unwrap();
        let bob = SimulationIdentity::new('B').unwrap();

        let (transport_a, transport_b) =
            MockTransportBuilder::new().create_connected_pair(alice, bob);

        transport_a.send(&bob, b"step one".to_vec()).await.unwrap();

        let (sender, data) = transport_b.recv().await.unwrap();
        assert_eq!(sender, alice);
        assert_eq!(data, b"step one".to_vec());
        assert_eq!(transport_a.sent_to(&bob), vec![b"step one".to_vec()]);
    }

    #[tokio::test]
    async fn test_mock_transport_not_connected() {
        let alice = SimulationIdentity::new('A').unwrap();
        let bob = SimulationIdentity::new('B').unwrap();

        let transport_a = MockTransport::new(alice);
        let result = transport_a.send(&bob, b"hello".to_vec()).await;
        assert!(matches!(result, Err(TransportError::PeerNotConnected(_))));
        assert!(transport_a.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn test_star_broadcast_from_hub() {
        let hub = SimulationIdentity::new('H').unwrap();
        let spokes = SimulationIdentity::range_to('C');

        let transports = MockTransportBuilder::new().create_star(hub, spokes.clone());
        let hub_transport = transports.get(&hub).unwrap();

        let delivered = hub_transport.broadcast(b"update".to_vec()).await.unwrap();
        assert_eq!(delivered.len(), 3);

        for spoke in &spokes {
            let (from, data) = transports.get(spoke).unwrap().recv().await.unwrap();
            assert_eq!(from, hub);
            assert_eq!(data, b"update".to_vec());
            assert_eq!(transports.get(spoke).unwrap().connection_count(), 1);
        }
    }

    #[tokio::test]
    async fn test_try_recv_and_inject() {
        let alice = SimulationIdentity::new('A').unwrap();
        let bob = SimulationIdentity::new('B').unwrap();
        let transport = MockTransport::new(alice);

        assert!(transport.try_recv().await.unwrap().is_none());

        transport.inject(bob, b"forged".to_vec()).await.unwrap();
        let (from, data) = transport.try_recv().await.unwrap().unwrap();
        assert_eq!(from, bob);
        assert_eq!(data, b"forged".to_vec());
    }

    #[tokio::test]
    async fn test_network_partition_and_heal() {
        let ids = SimulationIdentity::range_to('C');
        let network = MockNetwork::full_mesh(ids.clone());
        let a = network.get(&ids[0]).unwrap();

        network.partition(&ids[..1], &ids[1..]);
        assert!(!a.is_connected(&ids[1]));
        assert!(a.send(&ids[2], b"x".to_vec()).await.is_err());

        network.heal(&ids[..1], &ids[1..]);
        assert!(a.is_connected(&ids[1]));
        assert!(a.send(&ids[2], b"x".to_vec()).await.is_ok());
        assert_eq!(network.identities().len(), 3);
    }
}
