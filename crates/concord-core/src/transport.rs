//! Transport abstraction for frame delivery
//!
//! The connector never opens sockets. It hands opaque frames to a
//! [`Transport`] and is fed inbound frames, tagged with the sender's
//! identity, by whatever drives it.
//!
//! ## Implementations
//!
//! - [`MockTransport`](crate::MockTransport): In-memory channels for tests and the simulator

use async_trait::async_trait;

use crate::error::TransportError;
use crate::identity::PeerIdentity;

/// Frame transport between peers
///
/// Frames are delivered in order per peer pair. The transport itself is
/// the source of truth for sender identity.
///
/// # Example
///
/// ```rust,ignore
/// use concord_core::{Transport, SimulationIdentity};
///
/// async fn greet<T: Transport<SimulationIdentity>>(
///     transport: &T,
///     peer: &SimulationIdentity,
/// ) -> Result<(), TransportError> {
///     transport.send(peer, b"hello".to_vec()).await
/// }
/// ```
#[async_trait]
pub trait Transport<I: PeerIdentity>: Send + Sync {
    /// Send a frame to a specific peer
    ///
    /// # Errors
    ///
    /// Returns an error if the peer is not connected or if sending fails.
    async fn send(&self, peer: &I, data: Vec<u8>) -> Result<(), TransportError>;

    /// Receive the next frame from any peer
    ///
    /// Blocks until a frame is available. Returns the sender identity and
    /// the frame payload.
    async fn recv(&self) -> Result<(I, Vec<u8>), TransportError>;

    /// Check if we're currently connected to a peer
    fn is_connected(&self, peer: &I) -> bool;

    /// Get all currently connected peers
    fn connected_peers(&self) -> Vec<I>;

    /// Send a frame to every connected peer
    ///
    /// Returns the peers that accepted the frame. Individual failures are
    /// skipped rather than aborting the whole broadcast.
    async fn broadcast(&self, data: Vec<u8>) -> Result<Vec<I>, TransportError> {
        let peers = self.connected_peers();
        let mut delivered = Vec::with_capacity(peers.len());

        for peer in peers {
            if self.send(&peer, data.clone()).await.is_ok() {
                delivered.push(peer);
            }
        }

        Ok(delivered)
    }

    /// Try to receive a frame without blocking
    ///
    /// Returns `Ok(None)` if nothing is immediately available.
    async fn try_recv(&self) -> Result<Option<(I, Vec<u8>)>, TransportError> {
        match tokio::time::timeout(std::time::Duration::ZERO, self.recv()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Drop the link to a peer
    async fn disconnect(&self, _peer: &I) -> Result<(), TransportError> {
        Ok(())
    }

    /// Get the number of connected peers
    fn connection_count(&self) -> usize {
        self.connected_peers().len()
    }
}
