//! Per-peer log context
//!
//! Several connectors often share one process (simulations, tests). A
//! [`PeerContextGuard`] marks the current thread as acting for one local
//! peer; spans opened while it is active carry that peer's context, see
//! [`PeerContextLayer`](crate::layers::PeerContextLayer).

use std::cell::RefCell;

use concord_core::PeerIdentity;
use uuid::Uuid;

/// Identity of the local peer a span was opened for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerContext {
    pub peer_id: String,
    /// Distinguishes restarts of the same peer
    pub instance_id: Uuid,
}

thread_local! {
    static CURRENT: RefCell<Option<PeerContext>> = const { RefCell::new(None) };
}

/// Scope guard setting the current thread's peer context
///
/// Dropping the guard restores whatever context was active before, so
/// guards nest.
///
/// ```ignore
/// let _guard = PeerContextGuard::new(&node_id);
/// let span = tracing::info_span!("node");
/// ```
#[must_use = "the context is cleared when the guard is dropped"]
pub struct PeerContextGuard {
    previous: Option<PeerContext>,
}

impl PeerContextGuard {
    pub fn new<I: PeerIdentity>(identity: &I) -> Self {
        Self::with_instance_id(identity, Uuid::new_v4())
    }

    pub fn with_instance_id<I: PeerIdentity>(identity: &I, instance_id: Uuid) -> Self {
        let context = PeerContext {
            peer_id: identity.short_id(),
            instance_id,
        };
        let previous = CURRENT.with(|current| current.replace(Some(context)));
        Self { previous }
    }

    pub fn current() -> Option<PeerContext> {
        CURRENT.with(|current| current.borrow().clone())
    }

    pub fn current_peer_id() -> Option<String> {
        Self::current().map(|context| context.peer_id)
    }
}

impl Drop for PeerContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

/// Run `f` with `identity` as the current peer context
pub fn in_peer_context<I: PeerIdentity, R>(identity: &I, f: impl FnOnce() -> R) -> R {
    let _guard = PeerContextGuard::new(identity);
    f()
}
