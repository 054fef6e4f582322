//! The connector: peer lifecycle, scheduling and outbound traffic
//!
//! A [`Connector`] owns all per-node sync state behind one lock. Nothing is
//! awaited while the lock is held; every suspension point (store commits,
//! transport sends, auth resolution, the relay timer) happens after the
//! state transition it depends on has been made.
//!
//! Inbound message handling lives in the `handshake` module.

use std::sync::Arc;

use concord_core::{
    Clock, EncodedOp, GenerateIdentity, OperationCodec, PeerIdentity, ReplicaStore, SystemClock,
    Transport,
};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, instrument, warn};

use crate::broadcast::{BroadcastBuffer, RelaySet};
use crate::config::{ConnectorConfig, SyncRole};
use crate::error::{ConnectorError, ConnectorResult};
use crate::events::UserEvent;
use crate::message::HandshakeMessage;
use crate::permission::{AllowAll, AuthProvider};
use crate::registry::{PeerRegistry, PeerSnapshot};
use crate::scheduler::{ScheduleDecision, SyncScheduler};

/// Mutable per-node state
pub(crate) struct ConnectorState<I: PeerIdentity> {
    pub(crate) local_id: Option<I>,
    pub(crate) local_auth: Option<String>,
    pub(crate) registry: PeerRegistry<I>,
    pub(crate) scheduler: SyncScheduler<I>,
    pub(crate) outbound: BroadcastBuffer,
    pub(crate) relay: RelaySet<I>,
}

pub(crate) struct Inner<I: PeerIdentity, C: Clock> {
    pub(crate) config: ConnectorConfig,
    pub(crate) store: Arc<dyn ReplicaStore>,
    pub(crate) transport: Arc<dyn Transport<I>>,
    pub(crate) auth: Arc<dyn AuthProvider<I>>,
    pub(crate) clock: C,
    pub(crate) state: Mutex<ConnectorState<I>>,
    pub(crate) events: broadcast::Sender<UserEvent<I>>,
    /// Runtime for background work started from outside any runtime
    pub(crate) runtime: Option<Handle>,
}

/// Peer synchronization connector for one local replica
///
/// Cheap to clone; clones share the same state.
///
/// # Example
///
/// ```rust,ignore
/// use concord_sync::{Connector, ConnectorConfig, SyncRole};
///
/// let connector = Connector::builder(replica, transport)
///     .with_config(ConnectorConfig::default().with_role(SyncRole::Slave))
///     .with_local_id(me)
///     .build();
///
/// tokio::spawn({
///     let connector = connector.clone();
///     async move { connector.run().await }
/// });
/// connector.user_joined(server, Some(SyncRole::Master)).await?;
/// connector.synced().await;
/// ```
pub struct Connector<I: PeerIdentity, C: Clock = SystemClock> {
    pub(crate) inner: Arc<Inner<I, C>>,
}

impl<I: PeerIdentity, C: Clock> Clone for Connector<I, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I: PeerIdentity, C: Clock> std::fmt::Debug for Connector<I, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Connector")
            .field("local_id", &state.local_id)
            .field("role", &self.inner.config.role)
            .field("peers", &state.registry.len())
            .field("current_sync_target", &state.scheduler.current_target())
            .field("synced", &state.scheduler.is_synced())
            .finish()
    }
}

/// Builder for [`Connector`]
pub struct ConnectorBuilder<I: PeerIdentity, C: Clock = SystemClock> {
    config: ConnectorConfig,
    store: Arc<dyn ReplicaStore>,
    transport: Arc<dyn Transport<I>>,
    auth: Arc<dyn AuthProvider<I>>,
    clock: C,
    local_id: Option<I>,
    runtime: Option<Handle>,
}

impl<I: PeerIdentity, C: Clock> ConnectorBuilder<I, C> {
    pub fn with_config(mut self, config: ConnectorConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom auth provider instead of granting everyone write access
    pub fn with_auth<A: AuthProvider<I> + 'static>(mut self, auth: A) -> Self {
        self.auth = Arc::new(auth);
        self
    }

    pub fn with_shared_auth(mut self, auth: Arc<dyn AuthProvider<I>>) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_clock<C2: Clock>(self, clock: C2) -> ConnectorBuilder<I, C2> {
        ConnectorBuilder {
            config: self.config,
            store: self.store,
            transport: self.transport,
            auth: self.auth,
            clock,
            local_id: self.local_id,
            runtime: self.runtime,
        }
    }

    pub fn with_local_id(mut self, id: I) -> Self {
        self.local_id = Some(id);
        self
    }

    /// Runtime used for background work when the caller is not inside one
    ///
    /// Defaults to the runtime `build` is called in, if any.
    pub fn with_runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn build(self) -> Connector<I, C> {
        let runtime = self.runtime.or_else(|| Handle::try_current().ok());
        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        let state = ConnectorState {
            local_id: self.local_id,
            local_auth: self.config.auth.clone(),
            registry: PeerRegistry::new(),
            scheduler: SyncScheduler::new(),
            outbound: BroadcastBuffer::new(),
            relay: RelaySet::new(),
        };
        Connector {
            inner: Arc::new(Inner {
                config: self.config,
                store: self.store,
                transport: self.transport,
                auth: self.auth,
                clock: self.clock,
                state: Mutex::new(state),
                events,
                runtime,
            }),
        }
    }
}

impl<I: GenerateIdentity, C: Clock> ConnectorBuilder<I, C> {
    /// Mint a fresh local identity
    pub fn with_generated_id(mut self) -> Self {
        self.local_id = Some(I::generate());
        self
    }
}

impl<I: PeerIdentity> Connector<I> {
    /// Start building a connector over a replica store and a transport
    pub fn builder<S, T>(store: Arc<S>, transport: Arc<T>) -> ConnectorBuilder<I>
    where
        S: ReplicaStore + 'static,
        T: Transport<I> + 'static,
    {
        ConnectorBuilder {
            config: ConnectorConfig::default(),
            store,
            transport,
            auth: Arc::new(AllowAll),
            clock: SystemClock,
            local_id: None,
            runtime: None,
        }
    }
}

impl<I: PeerIdentity, C: Clock> Connector<I, C> {
    pub fn config(&self) -> &ConnectorConfig {
        &self.inner.config
    }

    pub fn role(&self) -> SyncRole {
        self.inner.config.role
    }

    pub fn local_id(&self) -> Option<I> {
        self.inner.state.lock().local_id.clone()
    }

    /// Set the local identity; only the first call takes effect
    pub fn set_user_id(&self, id: I) -> bool {
        let mut state = self.inner.state.lock();
        if state.local_id.is_some() {
            return false;
        }
        info!(local = %id.short_id(), "local identity set");
        state.local_id = Some(id);
        true
    }

    // ---- peer lifecycle ----

    /// Register a newly connected peer and start syncing if idle
    ///
    /// # Errors
    ///
    /// - [`ConnectorError::InvalidRole`] if no role is given
    /// - [`ConnectorError::AlreadyJoined`] if the peer is already registered
    #[instrument(skip_all, fields(peer = %peer.short_id()))]
    pub async fn user_joined(&self, peer: I, role: Option<SyncRole>) -> ConnectorResult<()> {
        let role = role.ok_or_else(|| ConnectorError::InvalidRole(String::new()))?;

        let decision = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            state.registry.join(peer.clone(), role)?;
            state.scheduler.mark_unsynced();
            state.scheduler.schedule(&state.registry)
        };

        info!(%role, "peer joined");
        self.emit(UserEvent::Joined { peer, role });
        self.execute(decision).await;
        Ok(())
    }

    /// Remove a departed peer; unknown peers are ignored
    #[instrument(skip_all, fields(peer = %peer.short_id()))]
    pub async fn user_left(&self, peer: &I) {
        let decision = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if state.registry.leave(peer).is_none() {
                return;
            }
            state.relay.remove(peer);
            state.scheduler.release_target(peer);
            state.scheduler.schedule(&state.registry)
        };

        info!("peer left");
        self.emit(UserEvent::Left { peer: peer.clone() });
        self.execute(decision).await;
    }

    /// Receive peer lifecycle events; dropping the receiver unsubscribes
    pub fn subscribe(&self) -> broadcast::Receiver<UserEvent<I>> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: UserEvent<I>) {
        // No receivers is fine.
        let _ = self.inner.events.send(event);
    }

    // ---- global sync status ----

    /// Run `f` once the node is globally synced (immediately if it already is)
    pub fn when_synced(&self, f: impl FnOnce() + Send + 'static) {
        let ready = self.inner.state.lock().scheduler.when_synced(Box::new(f));
        if let Some(f) = ready {
            f();
        }
    }

    /// Wait for the node to be globally synced
    ///
    /// Also returns if [`disconnect`](Self::disconnect) drops the pending wait.
    pub async fn synced(&self) {
        let (tx, rx) = oneshot::channel();
        self.when_synced(move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }

    pub fn is_synced(&self) -> bool {
        self.inner.state.lock().scheduler.is_synced()
    }

    // ---- lifecycle ----

    /// Present a new token to every peer, if it changed
    pub async fn reset_auth(&self, token: Option<String>) {
        let changed = {
            let mut state = self.inner.state.lock();
            if state.local_auth == token {
                false
            } else {
                state.local_auth = token.clone();
                true
            }
        };
        if changed {
            self.broadcast(&HandshakeMessage::AuthUpdate { auth: token }).await;
        }
    }

    /// Resume background maintenance of the replica
    pub async fn reconnect(&self) {
        info!("reconnecting");
        self.inner.store.start_garbage_collector().await;
    }

    /// Drop every peer record and wait for the replica to quiesce
    pub async fn disconnect(&self) -> ConnectorResult<()> {
        info!("disconnecting");
        {
            let mut state = self.inner.state.lock();
            state.registry.clear();
            state.scheduler.reset();
            state.relay.clear();
        }
        self.inner.store.stop_garbage_collector().await;
        self.inner.store.when_committed().await?;
        Ok(())
    }

    /// Mark every peer unsynced and start over
    ///
    /// For use when lost messages have left the replica inconsistent.
    pub async fn repair(&self) {
        warn!("repairing sync state, resyncing with every peer");
        let decision = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            state.registry.mark_all_unsynced();
            state.scheduler.restart();
            state.scheduler.schedule(&state.registry)
        };
        self.execute(decision).await;
    }

    // ---- scheduling ----

    pub(crate) async fn execute(&self, decision: ScheduleDecision<I>) {
        match decision {
            ScheduleDecision::Offer(peer) => self.send_offer(&peer).await,
            ScheduleDecision::BecameSynced(callbacks) => {
                info!(callbacks = callbacks.len(), "fully synced");
                for callback in callbacks {
                    callback();
                }
            }
            ScheduleDecision::Busy | ScheduleDecision::Idle => {}
        }
    }

    async fn send_offer(&self, peer: &I) {
        let state_set = self.inner.store.state_vector().await;
        let prefer_untransformed = self.inner.config.prefer_untransformed && state_set.is_empty();
        let auth = self.inner.state.lock().local_auth.clone();

        debug!(peer = %peer.short_id(), prefer_untransformed, "starting sync");
        let offer = HandshakeMessage::VersionOffer {
            state_set,
            protocol_version: self.inner.config.protocol_version,
            auth,
            prefer_untransformed,
        };
        self.send(peer, &offer).await;
    }

    /// Mark a peer synced and move on to the next target
    ///
    /// An abandoned handshake is never marked synced.
    pub(crate) async fn set_synced_with(&self, peer: &I) {
        let (marked, decision) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let marked = match state.registry.get_mut(peer) {
                Some(conn) if !conn.abandoned => {
                    conn.synced = true;
                    true
                }
                _ => false,
            };
            let decision = state
                .scheduler
                .release_target(peer)
                .then(|| state.scheduler.schedule(&state.registry));
            (marked, decision)
        };

        if marked {
            info!(peer = %peer.short_id(), "synced with peer");
        }
        if let Some(decision) = decision {
            self.execute(decision).await;
        }
    }

    /// Give up on the handshake with `peer` so the others can proceed
    ///
    /// The peer stays registered but is skipped by the scheduler until
    /// [`repair`](Self::repair) or a rejoin. Its phase-2 signal is resolved so
    /// nothing waits on it any longer.
    pub(crate) async fn abandon_handshake(&self, peer: &I) {
        let decision = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let Some(conn) = state.registry.get_mut(peer) else {
                return;
            };
            conn.abandoned = true;
            conn.synced = false;
            conn.step_two.resolve();
            state.relay.remove(peer);
            state
                .scheduler
                .release_target(peer)
                .then(|| state.scheduler.schedule(&state.registry))
        };

        warn!(peer = %peer.short_id(), "handshake abandoned");
        if let Some(decision) = decision {
            self.execute(decision).await;
        }
    }

    // ---- outbound ----

    /// Queue locally produced operations for broadcast
    ///
    /// Ops queued before the replica's pending mutations commit go out
    /// together in a single `update`. The flush runs on the current Tokio
    /// runtime, or the one the connector was built with. Without either the
    /// ops stay queued until a later call can schedule the flush.
    pub fn broadcast_ops<O: OperationCodec>(&self, ops: &[O]) {
        self.enqueue_encoded(ops.iter().map(OperationCodec::encode).collect());
    }

    pub(crate) fn enqueue_encoded(&self, ops: Vec<EncodedOp>) {
        let mut state = self.inner.state.lock();
        if !state.outbound.push(ops) {
            return;
        }
        let Some(runtime) = Handle::try_current().ok().or_else(|| self.inner.runtime.clone())
        else {
            warn!(queued = state.outbound.len(), "no Tokio runtime, broadcast deferred");
            state.outbound.cancel_flush();
            return;
        };
        drop(state);

        let this = self.clone();
        runtime.spawn(async move { this.flush_broadcast().await });
    }

    async fn flush_broadcast(&self) {
        if let Err(e) = self.inner.store.when_committed().await {
            warn!(error = %e, "replica did not commit before broadcast");
        }
        let ops = self.inner.state.lock().outbound.take();
        if !ops.is_empty() {
            debug!(ops = ops.len(), "broadcasting local operations");
            self.broadcast(&HandshakeMessage::Update { ops }).await;
        }
    }

    pub(crate) async fn send(&self, peer: &I, message: &HandshakeMessage) {
        let frame = match message.to_bytes() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind = message.kind(), error = %e, "failed to encode message");
                return;
            }
        };
        debug!(peer = %peer.short_id(), kind = message.kind(), "send");
        if let Err(e) = self.inner.transport.send(peer, frame).await {
            warn!(peer = %peer.short_id(), kind = message.kind(), error = %e, "send failed");
        }
    }

    pub(crate) async fn broadcast(&self, message: &HandshakeMessage) {
        let frame = match message.to_bytes() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind = message.kind(), error = %e, "failed to encode message");
                return;
            }
        };
        match self.inner.transport.broadcast(frame).await {
            Ok(delivered) => debug!(kind = message.kind(), peers = delivered.len(), "broadcast"),
            Err(e) => warn!(kind = message.kind(), error = %e, "broadcast failed"),
        }
    }

    // ---- introspection ----

    /// Registered peers, in join order
    pub fn peers(&self) -> Vec<I> {
        self.inner.state.lock().registry.ids()
    }

    pub fn peer_state(&self, peer: &I) -> Option<PeerSnapshot> {
        self.inner
            .state
            .lock()
            .registry
            .get(peer)
            .map(|conn| conn.snapshot())
    }

    pub fn current_sync_target(&self) -> Option<I> {
        self.inner.state.lock().scheduler.current_target().cloned()
    }

    /// Peers currently receiving forwarded updates
    pub fn relay_peers(&self) -> Vec<I> {
        self.inner.state.lock().relay.peers()
    }

    pub fn pending_broadcast_len(&self) -> usize {
        self.inner.state.lock().outbound.len()
    }
}

impl<I: GenerateIdentity, C: Clock> Connector<I, C> {
    /// The local identity, minting one if none has been set
    pub fn generate_user_id(&self) -> I {
        let mut state = self.inner.state.lock();
        state.local_id.get_or_insert_with(I::generate).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::{MemoryReplica, MockTransport, NodeId, SimulationIdentity};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn connector() -> Connector<SimulationIdentity> {
        let me = SimulationIdentity::new('A').unwrap();
        Connector::builder(Arc::new(MemoryReplica::new()), Arc::new(MockTransport::new(me))).build()
    }

    #[test]
    fn test_set_user_id_only_once() {
        let connector = connector();
        let a = SimulationIdentity::new('A').unwrap();
        let b = SimulationIdentity::new('B').unwrap();

        assert_eq!(connector.local_id(), None);
        assert!(connector.set_user_id(a));
        assert!(!connector.set_user_id(b));
        assert_eq!(connector.local_id(), Some(a));
    }

    #[test]
    fn test_generate_user_id_is_stable() {
        let me = NodeId::generate();
        let connector: Connector<NodeId> =
            Connector::builder(Arc::new(MemoryReplica::new()), Arc::new(MockTransport::new(me)))
                .build();

        let id = connector.generate_user_id();
        assert_eq!(connector.generate_user_id(), id);
        assert!(!connector.set_user_id(NodeId::generate()));
    }

    #[test]
    fn test_builder_applies_config() {
        let me = NodeId::generate();
        let connector: Connector<NodeId> =
            Connector::builder(Arc::new(MemoryReplica::new()), Arc::new(MockTransport::new(me)))
                .with_config(ConnectorConfig::default().with_role(SyncRole::Slave))
                .with_generated_id()
                .build();

        assert_eq!(connector.role(), SyncRole::Slave);
        assert!(connector.local_id().is_some());
        assert!(!connector.is_synced());
        assert!(format!("{:?}", connector).contains("Slave"));
    }

    fn linked_connector() -> (
        Connector<SimulationIdentity>,
        Arc<MemoryReplica>,
        MockTransport<SimulationIdentity>,
    ) {
        let a = SimulationIdentity::new('A').unwrap();
        let b = SimulationIdentity::new('B').unwrap();
        let (ta, tb) = concord_core::MockTransportBuilder::new().create_connected_pair(a, b);
        let replica = Arc::new(MemoryReplica::new());
        let connector = Connector::builder(replica.clone(), Arc::new(ta))
            .with_local_id(a)
            .build();
        (connector, replica, tb)
    }

    async fn next_update(peer: &MockTransport<SimulationIdentity>) -> Vec<EncodedOp> {
        let (_, frame) = tokio::time::timeout(std::time::Duration::from_secs(5), peer.recv())
            .await
            .unwrap()
            .unwrap();
        match HandshakeMessage::from_bytes(&frame).unwrap() {
            HandshakeMessage::Update { ops } => ops,
            other => panic!("expected update, got {}", other.kind()),
        }
    }

    #[test]
    fn test_broadcast_outside_runtime_uses_runtime_from_build() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (connector, replica, peer) = {
            let _entered = runtime.enter();
            linked_connector()
        };

        connector.broadcast_ops(&[replica.insert("alice", "hello")]);
        let ops = runtime.block_on(next_update(&peer));
        assert_eq!(ops.len(), 1);
        assert_eq!(connector.pending_broadcast_len(), 0);
    }

    #[test]
    fn test_broadcast_without_any_runtime_stays_queued() {
        let (connector, replica, peer) = linked_connector();

        connector.broadcast_ops(&[replica.insert("alice", "first")]);
        assert_eq!(connector.pending_broadcast_len(), 1);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let ops = runtime.block_on(async {
            connector.broadcast_ops(&[replica.insert("alice", "second")]);
            next_update(&peer).await
        });
        assert_eq!(
            ops.iter().map(|op| op.id.clock).collect::<Vec<_>>(),
            vec![0, 1]
        );
    }

    #[test]
    fn test_when_synced_queues_until_synced() {
        let connector = connector();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        connector.when_synced(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(connector.inner.state.lock().scheduler.pending_callbacks(), 1);
    }
}
