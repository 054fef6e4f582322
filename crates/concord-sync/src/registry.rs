//! Peer registry
//!
//! One [`PeerConnection`] per joined peer, kept in join order. The order
//! matters: the scheduler always picks the earliest-joined unsynced peer.

use std::future::Future;
use std::sync::Arc;

use concord_core::PeerIdentity;
use indexmap::IndexMap;
use tokio::sync::watch;

use crate::config::SyncRole;
use crate::error::{ConnectorError, ConnectorResult};
use crate::permission::{Permission, PermissionSlot};

/// Resolved exactly once, when a peer's phase-2 payload has been applied
#[derive(Debug, Clone)]
pub struct StepTwoSignal(Arc<watch::Sender<bool>>);

impl Default for StepTwoSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StepTwoSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self(Arc::new(tx))
    }

    pub fn resolve(&self) {
        self.0.send_replace(true);
    }

    pub fn is_resolved(&self) -> bool {
        *self.0.borrow()
    }

    /// Completes once resolved, or once the owning connection is dropped
    pub fn waiter(&self) -> impl Future<Output = ()> + Send + use<> {
        let mut rx = self.0.subscribe();
        async move {
            let _ = rx.wait_for(|resolved| *resolved).await;
        }
    }
}

/// Per-peer connection record
#[derive(Debug)]
pub struct PeerConnection {
    pub role: SyncRole,
    pub synced: bool,
    /// The handshake with this peer failed (version skew or a payload that
    /// could not be applied); the scheduler skips it until repair or rejoin
    pub abandoned: bool,
    pub(crate) permission: Option<PermissionSlot>,
    pub(crate) step_two: StepTwoSignal,
}

impl PeerConnection {
    fn new(role: SyncRole) -> Self {
        Self {
            role,
            synced: false,
            abandoned: false,
            permission: None,
            step_two: StepTwoSignal::new(),
        }
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            role: self.role,
            synced: self.synced,
            abandoned: self.abandoned,
            permission: self.permission.as_ref().and_then(PermissionSlot::peek),
            step_two_resolved: self.step_two.is_resolved(),
        }
    }
}

/// Point-in-time view of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub role: SyncRole,
    pub synced: bool,
    pub abandoned: bool,
    /// `None` until the first resolution has finished
    pub permission: Option<Permission>,
    pub step_two_resolved: bool,
}

/// All live peer connections, in join order
#[derive(Debug)]
pub struct PeerRegistry<I: PeerIdentity> {
    peers: IndexMap<I, PeerConnection>,
}

impl<I: PeerIdentity> Default for PeerRegistry<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: PeerIdentity> PeerRegistry<I> {
    pub fn new() -> Self {
        Self {
            peers: IndexMap::new(),
        }
    }

    /// Register a peer as unsynced
    ///
    /// # Errors
    ///
    /// [`ConnectorError::AlreadyJoined`] if the peer is already registered;
    /// the existing record is left untouched.
    pub fn join(&mut self, peer: I, role: SyncRole) -> ConnectorResult<()> {
        if self.peers.contains_key(&peer) {
            return Err(ConnectorError::AlreadyJoined(peer.short_id()));
        }
        self.peers.insert(peer, PeerConnection::new(role));
        Ok(())
    }

    /// Remove a peer, keeping the order of the rest
    pub fn leave(&mut self, peer: &I) -> Option<PeerConnection> {
        self.peers.shift_remove(peer)
    }

    pub fn get(&self, peer: &I) -> Option<&PeerConnection> {
        self.peers.get(peer)
    }

    pub fn get_mut(&mut self, peer: &I) -> Option<&mut PeerConnection> {
        self.peers.get_mut(peer)
    }

    pub fn contains(&self, peer: &I) -> bool {
        self.peers.contains_key(peer)
    }

    /// Earliest-joined peer that still needs a handshake
    ///
    /// Abandoned peers are skipped.
    pub fn first_unsynced(&self) -> Option<I> {
        self.peers
            .iter()
            .find(|(_, conn)| !conn.synced && !conn.abandoned)
            .map(|(peer, _)| peer.clone())
    }

    pub fn all_synced(&self) -> bool {
        self.peers.values().all(|conn| conn.synced)
    }

    /// Waiters for every master whose phase-2 payload is still outstanding
    pub fn master_waiters(&self) -> Vec<impl Future<Output = ()> + Send + use<I>> {
        self.peers
            .values()
            .filter(|conn| conn.role == SyncRole::Master && !conn.step_two.is_resolved())
            .map(|conn| conn.step_two.waiter())
            .collect()
    }

    /// Forget every completed and abandoned handshake
    pub fn mark_all_unsynced(&mut self) {
        for conn in self.peers.values_mut() {
            conn.synced = false;
            conn.abandoned = false;
        }
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    /// Peer ids in join order
    pub fn ids(&self) -> Vec<I> {
        self.peers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::SimulationIdentity;
    use futures::future::join_all;

    fn ids() -> Vec<SimulationIdentity> {
        SimulationIdentity::range_to('D')
    }

    #[test]
    fn test_join_rejects_duplicates() {
        let ids = ids();
        let mut registry = PeerRegistry::new();
        registry.join(ids[0], SyncRole::Master).unwrap();

        let err = registry.join(ids[0], SyncRole::Slave).unwrap_err();
        assert!(matches!(err, ConnectorError::AlreadyJoined(_)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&ids[0]).unwrap().role, SyncRole::Master);
    }

    #[test]
    fn test_first_unsynced_follows_join_order() {
        let ids = ids();
        let mut registry = PeerRegistry::new();
        for id in &ids {
            registry.join(*id, SyncRole::Master).unwrap();
        }

        registry.get_mut(&ids[0]).unwrap().synced = true;
        assert_eq!(registry.first_unsynced(), Some(ids[1]));

        registry.leave(&ids[1]);
        assert_eq!(registry.first_unsynced(), Some(ids[2]));
        assert_eq!(registry.ids(), vec![ids[0], ids[2], ids[3]]);
    }

    #[test]
    fn test_all_synced_and_repair() {
        let ids = ids();
        let mut registry = PeerRegistry::new();
        assert!(registry.all_synced());

        registry.join(ids[0], SyncRole::Master).unwrap();
        assert!(!registry.all_synced());

        registry.get_mut(&ids[0]).unwrap().synced = true;
        assert!(registry.all_synced());

        registry.mark_all_unsynced();
        assert_eq!(registry.first_unsynced(), Some(ids[0]));
    }

    #[test]
    fn test_abandoned_peers_are_skipped_until_repair() {
        let ids = ids();
        let mut registry = PeerRegistry::new();
        registry.join(ids[0], SyncRole::Master).unwrap();
        registry.join(ids[1], SyncRole::Master).unwrap();

        registry.get_mut(&ids[0]).unwrap().abandoned = true;
        assert_eq!(registry.first_unsynced(), Some(ids[1]));

        registry.get_mut(&ids[1]).unwrap().synced = true;
        assert_eq!(registry.first_unsynced(), None);
        assert!(!registry.all_synced());
        assert!(registry.get(&ids[0]).unwrap().snapshot().abandoned);

        registry.mark_all_unsynced();
        assert_eq!(registry.first_unsynced(), Some(ids[0]));
        assert!(!registry.get(&ids[0]).unwrap().abandoned);
    }

    #[tokio::test]
    async fn test_master_waiters() {
        let ids = ids();
        let mut registry = PeerRegistry::new();
        registry.join(ids[0], SyncRole::Master).unwrap();
        registry.join(ids[1], SyncRole::Slave).unwrap();
        registry.join(ids[2], SyncRole::Master).unwrap();

        registry.get(&ids[2]).unwrap().step_two.resolve();
        let waiters = registry.master_waiters();
        assert_eq!(waiters.len(), 1);

        let signal = registry.get(&ids[0]).unwrap().step_two.clone();
        let all = tokio::spawn(join_all(waiters));
        tokio::task::yield_now().await;
        assert!(!all.is_finished());

        signal.resolve();
        all.await.unwrap();
        assert!(registry.get(&ids[0]).unwrap().snapshot().step_two_resolved);
    }

    #[tokio::test]
    async fn test_waiter_completes_when_peer_leaves() {
        let ids = ids();
        let mut registry = PeerRegistry::new();
        registry.join(ids[0], SyncRole::Master).unwrap();

        let waiters = registry.master_waiters();
        registry.leave(&ids[0]);
        join_all(waiters).await;
    }
}
