//! # Concord Sync
//!
//! Peer synchronization connector for replicated shared-editing documents.
//!
//! A [`Connector`] sits between a [`ReplicaStore`](concord_core::ReplicaStore)
//! and a [`Transport`](concord_core::Transport). It keeps the replica in
//! sync with every connected peer:
//!
//! - **Registry**: one record per peer, with its role, sync status and
//!   memoized permission
//! - **Scheduling**: a three-message handshake with one peer at a time,
//!   in join order, until every peer is synced
//! - **Auth gate**: offers need read access, payloads and updates need write
//! - **Broadcast**: local ops are coalesced until the replica commits, then
//!   sent as a single `update`
//! - **Relay**: live updates are forwarded to peers still mid-handshake
//!   until their grace window closes
//!
//! ## Example
//!
//! ```rust,ignore
//! use concord_sync::{Connector, ConnectorConfig, SyncRole};
//!
//! let connector = Connector::builder(replica.clone(), transport)
//!     .with_config(ConnectorConfig::default().with_auth("secret"))
//!     .with_local_id(me)
//!     .build();
//!
//! connector.user_joined(peer, Some(SyncRole::Master)).await?;
//! connector.broadcast_ops(&[replica.insert("alice", "hello")]);
//! ```

pub mod broadcast;
pub mod config;
pub mod connector;
pub mod error;
pub mod events;
mod handshake;
pub mod message;
pub mod permission;
pub mod registry;
pub mod scheduler;

pub use broadcast::{BroadcastBuffer, RelaySet};
pub use config::{
    ConnectorConfig, DEFAULT_EVENT_CAPACITY, DEFAULT_SYNC_GRACE, PROTOCOL_VERSION, SyncRole,
};
pub use connector::{Connector, ConnectorBuilder};
pub use error::{ConnectorError, ConnectorResult};
pub use events::UserEvent;
pub use message::HandshakeMessage;
pub use permission::{AllowAll, AuthProvider, AuthRequest, Permission, TokenTable};
pub use registry::{PeerConnection, PeerRegistry, PeerSnapshot, StepTwoSignal};
pub use scheduler::{ScheduleDecision, SyncScheduler, SyncedCallback};
