//! Sync target scheduler
//!
//! At most one peer is the active sync target at any instant. The scheduler
//! is re-entered after every join, every completed handshake and every
//! leave; each pass either starts the next handshake or, when nobody is left
//! unsynced, flips the node to globally synced and hands back the queued
//! callbacks.

use concord_core::PeerIdentity;

use crate::registry::PeerRegistry;

/// One-shot callback run on the next transition to globally synced
pub type SyncedCallback = Box<dyn FnOnce() + Send + 'static>;

/// What a scheduling pass decided
pub enum ScheduleDecision<I> {
    /// A handshake is already in flight
    Busy,
    /// Start a handshake with this peer
    Offer(I),
    /// The node just became globally synced; run these callbacks
    BecameSynced(Vec<SyncedCallback>),
    /// Nothing to do
    Idle,
}

impl<I: std::fmt::Debug> std::fmt::Debug for ScheduleDecision<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleDecision::Busy => write!(f, "Busy"),
            ScheduleDecision::Offer(peer) => f.debug_tuple("Offer").field(peer).finish(),
            ScheduleDecision::BecameSynced(callbacks) => {
                write!(f, "BecameSynced({} callbacks)", callbacks.len())
            }
            ScheduleDecision::Idle => write!(f, "Idle"),
        }
    }
}

/// Single-target sync scheduler
pub struct SyncScheduler<I> {
    current_target: Option<I>,
    globally_synced: bool,
    listeners: Vec<SyncedCallback>,
}

impl<I> Default for SyncScheduler<I> {
    fn default() -> Self {
        Self {
            current_target: None,
            globally_synced: false,
            listeners: Vec::new(),
        }
    }
}

impl<I: PeerIdentity> SyncScheduler<I> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the next sync target or report global completion
    pub fn schedule(&mut self, registry: &PeerRegistry<I>) -> ScheduleDecision<I> {
        if self.current_target.is_some() {
            return ScheduleDecision::Busy;
        }

        if let Some(peer) = registry.first_unsynced() {
            self.current_target = Some(peer.clone());
            return ScheduleDecision::Offer(peer);
        }

        // Abandoned peers keep the node from counting as synced.
        if self.globally_synced || !registry.all_synced() {
            return ScheduleDecision::Idle;
        }
        self.globally_synced = true;
        ScheduleDecision::BecameSynced(std::mem::take(&mut self.listeners))
    }

    /// Queue a callback, or hand it straight back if already synced
    pub fn when_synced(&mut self, callback: SyncedCallback) -> Option<SyncedCallback> {
        if self.globally_synced {
            Some(callback)
        } else {
            self.listeners.push(callback);
            None
        }
    }

    /// A peer that has not synced yet exists again
    pub fn mark_unsynced(&mut self) {
        self.globally_synced = false;
    }

    /// Clear the target if it is `peer`; returns whether it was
    pub fn release_target(&mut self, peer: &I) -> bool {
        if self.current_target.as_ref() == Some(peer) {
            self.current_target = None;
            true
        } else {
            false
        }
    }

    /// Forget the target and mark unsynced, keeping queued callbacks
    pub fn restart(&mut self) {
        self.current_target = None;
        self.globally_synced = false;
    }

    /// Back to the initial state, dropping queued callbacks
    pub fn reset(&mut self) {
        self.restart();
        self.listeners.clear();
    }

    pub fn current_target(&self) -> Option<&I> {
        self.current_target.as_ref()
    }

    pub fn is_synced(&self) -> bool {
        self.globally_synced
    }

    pub fn pending_callbacks(&self) -> usize {
        self.listeners.len()
    }
}
