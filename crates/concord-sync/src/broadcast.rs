//! Outbound batching and the relay set
//!
//! [`BroadcastBuffer`] coalesces locally produced operations until the
//! replica's queue has committed them. [`RelaySet`] tracks peers that are
//! mid-handshake and should see live updates until their grace deadline.

use std::time::Instant;

use concord_core::{EncodedOp, PeerIdentity};
use indexmap::IndexMap;

/// Encoded operations awaiting the next flush
#[derive(Debug, Default)]
pub struct BroadcastBuffer {
    pending: Vec<EncodedOp>,
    flush_scheduled: bool,
}

impl BroadcastBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append ops; returns true if ops are pending and no flush is scheduled
    /// yet, i.e. the caller must schedule one
    pub fn push(&mut self, ops: impl IntoIterator<Item = EncodedOp>) -> bool {
        self.pending.extend(ops);
        if self.flush_scheduled || self.pending.is_empty() {
            return false;
        }
        self.flush_scheduled = true;
        true
    }

    /// The flush promised by the last `push` could not be scheduled; the
    /// next push asks again
    pub fn cancel_flush(&mut self) {
        self.flush_scheduled = false;
    }

    /// Drain everything buffered
    pub fn take(&mut self) -> Vec<EncodedOp> {
        self.flush_scheduled = false;
        std::mem::take(&mut self.pending)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Peers receiving forwarded live updates, each with an expiry deadline
#[derive(Debug)]
pub struct RelaySet<I: PeerIdentity> {
    deadlines: IndexMap<I, Instant>,
}

impl<I: PeerIdentity> Default for RelaySet<I> {
    fn default() -> Self {
        Self {
            deadlines: IndexMap::new(),
        }
    }
}

impl<I: PeerIdentity> RelaySet<I> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer, or push its deadline out if already present
    pub fn insert(&mut self, peer: I, deadline: Instant) {
        self.deadlines.insert(peer, deadline);
    }

    pub fn remove(&mut self, peer: &I) -> bool {
        self.deadlines.shift_remove(peer).is_some()
    }

    /// Remove the peer if its deadline has passed; returns whether it was removed
    pub fn expire(&mut self, peer: &I, now: Instant) -> bool {
        match self.deadlines.get(peer) {
            Some(deadline) if *deadline <= now => {
                self.deadlines.shift_remove(peer);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, peer: &I) -> bool {
        self.deadlines.contains_key(peer)
    }

    pub fn peers(&self) -> Vec<I> {
        self.deadlines.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}
