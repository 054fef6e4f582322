//! Auth gate
//!
//! Each peer's permission is resolved once through an [`AuthProvider`] and
//! memoized as a shared future. Only an inbound `auth` message carrying a
//! different token causes a fresh resolution.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use concord_core::PeerIdentity;
use derive_more::Display;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};

/// Access level granted to a peer; `Write` implies `Read`
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Display, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    #[default]
    #[display("none")]
    None,
    #[display("read")]
    Read,
    #[display("write")]
    Write,
}

impl Permission {
    pub fn can_read(self) -> bool {
        self >= Permission::Read
    }

    pub fn can_write(self) -> bool {
        self >= Permission::Write
    }
}

/// What an auth provider gets to decide on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest<I> {
    pub peer: I,
    pub token: Option<String>,
}

/// Decides what a peer may do
#[async_trait]
pub trait AuthProvider<I: PeerIdentity>: Send + Sync {
    async fn check_auth(&self, request: AuthRequest<I>) -> Permission;
}

/// Grants `Write` to everyone
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl<I: PeerIdentity> AuthProvider<I> for AllowAll {
    async fn check_auth(&self, _request: AuthRequest<I>) -> Permission {
        Permission::Write
    }
}

/// Fixed token table with a fallback for unknown or missing tokens
#[derive(Debug, Clone, Default)]
pub struct TokenTable {
    tokens: HashMap<String, Permission>,
    fallback: Permission,
}

impl TokenTable {
    pub fn new(fallback: Permission) -> Self {
        Self {
            tokens: HashMap::new(),
            fallback,
        }
    }

    pub fn grant(mut self, token: impl Into<String>, permission: Permission) -> Self {
        self.tokens.insert(token.into(), permission);
        self
    }
}

#[async_trait]
impl<I: PeerIdentity> AuthProvider<I> for TokenTable {
    async fn check_auth(&self, request: AuthRequest<I>) -> Permission {
        request
            .token
            .and_then(|token| self.tokens.get(&token).copied())
            .unwrap_or(self.fallback)
    }
}

/// Memoized permission resolution for one peer
#[derive(Clone)]
pub(crate) struct PermissionSlot {
    token: Option<String>,
    resolution: Shared<BoxFuture<'static, Permission>>,
}

impl PermissionSlot {
    /// Start resolving; the provider is invoked at most once per slot
    pub(crate) fn resolve<I: PeerIdentity>(
        auth: Arc<dyn AuthProvider<I>>,
        peer: I,
        token: Option<String>,
    ) -> Self {
        let request = AuthRequest {
            peer,
            token: token.clone(),
        };
        let resolution = async move { auth.check_auth(request).await }.boxed().shared();
        Self { token, resolution }
    }

    pub(crate) fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Resolved permission, if resolution already finished
    pub(crate) fn peek(&self) -> Option<Permission> {
        self.resolution.peek().copied()
    }

    pub(crate) fn permission(&self) -> Shared<BoxFuture<'static, Permission>> {
        self.resolution.clone()
    }
}

impl std::fmt::Debug for PermissionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionSlot")
            .field("token", &self.token)
            .field("resolved", &self.peek())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::SimulationIdentity;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    #[async_trait]
    impl AuthProvider<SimulationIdentity> for Counting {
        async fn check_auth(&self, _request: AuthRequest<SimulationIdentity>) -> Permission {
            self.0.fetch_add(1, Ordering::SeqCst);
            Permission::Read
        }
    }

    #[test]
    fn test_permission_ordering() {
        assert!(Permission::Write > Permission::Read);
        assert!(Permission::Read > Permission::None);
        assert!(Permission::Write.can_read());
        assert!(!Permission::Read.can_write());
        assert!(!Permission::None.can_read());
        assert_eq!(Permission::Write.to_string(), "write");
    }

    #[tokio::test]
    async fn test_token_table() {
        let table = TokenTable::new(Permission::None)
            .grant("reader", Permission::Read)
            .grant("writer", Permission::Write);
        let peer = SimulationIdentity::new('B').unwrap();

        let ask = |token: Option<&str>| AuthRequest {
            peer,
            token: token.map(String::from),
        };
        assert_eq!(table.check_auth(ask(Some("writer"))).await, Permission::Write);
        assert_eq!(table.check_auth(ask(Some("reader"))).await, Permission::Read);
        assert_eq!(table.check_auth(ask(Some("guess"))).await, Permission::None);
        assert_eq!(table.check_auth(ask(None)).await, Permission::None);
    }

    #[tokio::test]
    async fn test_slot_invokes_provider_once() {
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        let peer = SimulationIdentity::new('B').unwrap();
        let auth: Arc<dyn AuthProvider<SimulationIdentity>> = counting.clone();
        let slot = PermissionSlot::resolve(auth, peer, Some("t".into()));

        assert_eq!(slot.peek(), None);
        assert_eq!(slot.permission().await, Permission::Read);
        assert_eq!(slot.clone().permission().await, Permission::Read);
        assert_eq!(slot.peek(), Some(Permission::Read));
        assert_eq!(slot.token(), Some("t"));
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
    }
}
