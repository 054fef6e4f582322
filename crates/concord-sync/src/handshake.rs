//! Inbound message handling
//!
//! ```text
//!  A (scheduler picked B)                 B
//!  ─────────────────────                 ─
//!  sync step 1 {stateSet} ──────────────▶ gate: read
//!                                        ops since A's stateSet
//!                         ◀────────────── sync step 2 {stateSet, deleteSet, os}
//!  gate: write                            B relays live updates to A ...
//!  apply os, wait commit,
//!  apply deleteSet, resolve step 2
//!                         ◀────────────── sync done   (after grace, or at once)
//!  wait step 2, mark B synced,
//!  schedule next target
//! ```
//!
//! Both sides run this exchange independently, so a fully connected pair
//! performs two handshakes.

use std::time::Duration;

use concord_core::{Clock, DeleteSet, EncodedOp, PeerIdentity, StateVector};
use futures::future::{BoxFuture, Shared, join_all};
use tracing::{debug, info, instrument, warn};

use crate::config::SyncRole;
use crate::connector::Connector;
use crate::error::{ConnectorError, ConnectorResult};
use crate::events::UserEvent;
use crate::message::HandshakeMessage;
use crate::permission::{Permission, PermissionSlot};

impl<I: PeerIdentity, C: Clock> Connector<I, C> {
    /// Pump inbound frames from the transport until it fails
    ///
    /// Undecodable frames and rejected messages are logged and skipped.
    pub async fn run(&self) -> ConnectorResult<()> {
        loop {
            let (sender, frame) = self.inner.transport.recv().await?;
            let message = match HandshakeMessage::from_bytes(&frame) {
                Ok(message) => message,
                Err(e) => {
                    warn!(peer = %sender.short_id(), error = %e, "dropping undecodable frame");
                    continue;
                }
            };
            if let Err(e) = self.receive_message(&sender, message).await {
                warn!(peer = %sender.short_id(), error = %e, "message rejected");
            }
        }
    }

    /// Handle one message from `sender`
    ///
    /// Messages the sender lacks permission for are dropped and still return
    /// `Ok`. Some follow-up work (a slave answering an offer, completing a
    /// handshake whose phase 2 is still in flight) continues in the
    /// background after this returns.
    ///
    /// # Errors
    ///
    /// - [`ConnectorError::IncompatibleProtocolVersion`] if the message
    ///   carries a different protocol version; a `sync stop` is sent back
    ///   unless the message was itself a stop
    /// - [`ConnectorError::DeliveryFailure`] if the sender is not registered
    /// - [`ConnectorError::Store`] if applying a payload fails
    #[instrument(skip_all, fields(peer = %sender.short_id(), kind = message.kind()))]
    pub async fn receive_message(
        &self,
        sender: &I,
        message: HandshakeMessage,
    ) -> ConnectorResult<()> {
        if self.local_id().as_ref() == Some(sender) {
            return Ok(());
        }
        debug!("receive");

        let local = self.inner.config.protocol_version;
        if let Some(remote) = message.protocol_version()
            && remote != local
        {
            info!(local, remote, "protocol version mismatch, refusing to sync");
            if !matches!(message, HandshakeMessage::Stop { .. }) {
                let stop = HandshakeMessage::Stop {
                    protocol_version: local,
                };
                self.send(sender, &stop).await;
            }
            self.abandon_handshake(sender).await;
            return Err(ConnectorError::IncompatibleProtocolVersion { local, remote });
        }

        let (resolution, announce) = self.permission_for(sender, &message)?;
        let permission = resolution.await;
        if announce {
            debug!(%permission, "peer authenticated");
            self.emit(UserEvent::Authenticated {
                peer: sender.clone(),
                permission,
            });
        }

        match message {
            HandshakeMessage::VersionOffer {
                state_set,
                prefer_untransformed,
                ..
            } => {
                if !permission.can_read() {
                    debug!(%permission, "dropping offer from peer without read access");
                    return Ok(());
                }
                self.handle_offer(sender, state_set, prefer_untransformed)
                    .await
            }
            HandshakeMessage::StateAndOps {
                state_set,
                delete_set,
                os,
                os_untransformed,
                ..
            } => {
                if !permission.can_write() {
                    debug!(%permission, "dropping sync payload from peer without write access");
                    return Ok(());
                }
                self.handle_state_and_ops(sender, state_set, delete_set, os, os_untransformed)
                    .await
            }
            HandshakeMessage::Done => {
                self.handle_done(sender).await;
                Ok(())
            }
            HandshakeMessage::Update { ops } => {
                if !permission.can_write() {
                    debug!(%permission, "dropping update from peer without write access");
                    return Ok(());
                }
                self.handle_update(ops).await
            }
            HandshakeMessage::Stop { .. } => {
                info!("peer stopped syncing with us");
                Ok(())
            }
            HandshakeMessage::AuthUpdate { .. } => Ok(()),
        }
    }

    /// The sender's memoized permission, refreshing it on a changed token
    ///
    /// Also reports whether the resolution should be announced as an
    /// authentication event.
    fn permission_for(
        &self,
        sender: &I,
        message: &HandshakeMessage,
    ) -> ConnectorResult<(Shared<BoxFuture<'static, Permission>>, bool)> {
        let mut state = self.inner.state.lock();
        let conn = state
            .registry
            .get_mut(sender)
            .ok_or_else(|| ConnectorError::DeliveryFailure(sender.short_id()))?;

        let token = message.auth_token();
        let refresh = match &conn.permission {
            None => true,
            Some(slot) => {
                matches!(message, HandshakeMessage::AuthUpdate { .. }) && slot.token() != token
            }
        };

        let mut announce = false;
        if refresh {
            announce = token.is_some() || conn.permission.is_some();
            conn.permission = Some(PermissionSlot::resolve(
                self.inner.auth.clone(),
                sender.clone(),
                token.map(String::from),
            ));
        }

        let resolution = conn
            .permission
            .as_ref()
            .map(PermissionSlot::permission)
            .ok_or_else(|| ConnectorError::DeliveryFailure(sender.short_id()))?;
        Ok((resolution, announce))
    }

    async fn handle_offer(
        &self,
        sender: &I,
        offered: StateVector,
        prefer_untransformed: bool,
    ) -> ConnectorResult<()> {
        let waiters = if self.inner.config.role == SyncRole::Slave {
            self.inner.state.lock().registry.master_waiters()
        } else {
            Vec::new()
        };
        if waiters.is_empty() {
            return self
                .answer_offer(sender, offered, prefer_untransformed)
                .await;
        }

        // A slave serves nobody until every master has delivered phase 2.
        debug!(masters = waiters.len(), "deferring offer until masters are applied");
        let this = self.clone();
        let peer = sender.clone();
        tokio::spawn(async move {
            join_all(waiters).await;
            if let Err(e) = this.answer_offer(&peer, offered, prefer_untransformed).await {
                warn!(peer = %peer.short_id(), error = %e, "failed to answer deferred offer");
            }
        });
        Ok(())
    }

    async fn answer_offer(
        &self,
        peer: &I,
        offered: StateVector,
        prefer_untransformed: bool,
    ) -> ConnectorResult<()> {
        if !self.inner.state.lock().registry.contains(peer) {
            debug!(peer = %peer.short_id(), "peer left before its offer was answered");
            return Ok(());
        }

        let store = &self.inner.store;
        let state_set = store.state_vector().await;
        let delete_set = store.delete_set().await;
        let (os, os_untransformed) = if prefer_untransformed && offered.is_empty() {
            (None, Some(store.full_operation_log().await?))
        } else {
            (Some(store.ops_since(&offered).await?), None)
        };

        let answer = HandshakeMessage::StateAndOps {
            state_set,
            delete_set,
            protocol_version: self.inner.config.protocol_version,
            auth: self.inner.state.lock().local_auth.clone(),
            os,
            os_untransformed,
        };
        self.send(peer, &answer).await;

        if self.inner.config.forward_to_syncing_clients {
            let grace = self.inner.config.sync_grace;
            let deadline = self.inner.clock.now() + grace;
            self.inner
                .state
                .lock()
                .relay
                .insert(peer.clone(), deadline);

            let this = self.clone();
            let peer = peer.clone();
            tokio::spawn(async move { this.close_relay_after(peer, grace).await });
        } else {
            self.send(peer, &HandshakeMessage::Done).await;
        }
        Ok(())
    }

    async fn close_relay_after(&self, peer: I, grace: Duration) {
        self.inner.clock.sleep(grace).await;
        let now = self.inner.clock.now();
        let expired = self.inner.state.lock().relay.expire(&peer, now);
        if expired {
            debug!(peer = %peer.short_id(), "relay window closed");
            self.send(&peer, &HandshakeMessage::Done).await;
        }
    }

    async fn handle_state_and_ops(
        &self,
        sender: &I,
        state_set: StateVector,
        delete_set: DeleteSet,
        os: Option<Vec<EncodedOp>>,
        os_untransformed: Option<Vec<EncodedOp>>,
    ) -> ConnectorResult<()> {
        let signal = self
            .inner
            .state
            .lock()
            .registry
            .get(sender)
            .map(|conn| conn.step_two.clone());
        let Some(signal) = signal else {
            return Ok(());
        };

        let applied = self
            .apply_step_two(state_set, delete_set, os, os_untransformed)
            .await;
        if let Err(e) = applied {
            self.abandon_handshake(sender).await;
            return Err(e);
        }

        signal.resolve();
        debug!("sync step 2 applied");
        Ok(())
    }

    async fn apply_step_two(
        &self,
        state_set: StateVector,
        delete_set: DeleteSet,
        os: Option<Vec<EncodedOp>>,
        os_untransformed: Option<Vec<EncodedOp>>,
    ) -> ConnectorResult<()> {
        let store = &self.inner.store;
        match os_untransformed {
            Some(log) => store.apply_untransformed(log, &state_set).await?,
            None => store.apply_ops(os.unwrap_or_default()).await?,
        }
        // Tombstones may refer to ops that were only just queued above.
        store.when_committed().await?;
        store.apply_delete_set(delete_set).await?;
        Ok(())
    }

    async fn handle_done(&self, sender: &I) {
        let signal = self
            .inner
            .state
            .lock()
            .registry
            .get(sender)
            .map(|conn| conn.step_two.clone());
        let Some(signal) = signal else {
            return;
        };

        if signal.is_resolved() {
            self.set_synced_with(sender).await;
            return;
        }

        // Phase 2 from this peer is still being applied.
        let waiter = signal.waiter();
        drop(signal);
        let this = self.clone();
        let peer = sender.clone();
        tokio::spawn(async move {
            waiter.await;
            this.set_synced_with(&peer).await;
        });
    }

    async fn handle_update(&self, ops: Vec<EncodedOp>) -> ConnectorResult<()> {
        if self.inner.config.forward_to_syncing_clients {
            let relay = self.inner.state.lock().relay.peers();
            if !relay.is_empty() {
                debug!(peers = relay.len(), "relaying update to syncing peers");
                let forwarded = HandshakeMessage::Update { ops: ops.clone() };
                for peer in &relay {
                    self.send(peer, &forwarded).await;
                }
            }
        }

        if self.inner.config.forward_applied_operations {
            let deletes: Vec<EncodedOp> = ops.iter().filter(|op| op.is_delete()).cloned().collect();
            if !deletes.is_empty() {
                self.enqueue_encoded(deletes);
            }
        }

        self.inner.store.apply_ops(ops).await?;
        Ok(())
    }
}
