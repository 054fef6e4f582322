//! Connector configuration

use std::str::FromStr;
use std::time::Duration;

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::error::ConnectorError;

/// Protocol version spoken by this build
pub const PROTOCOL_VERSION: u32 = 11;

/// How long a peer stays in the relay set after its state was sent
pub const DEFAULT_SYNC_GRACE: Duration = Duration::from_secs(5);

/// Default capacity of the peer event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Role a node plays in the handshake ordering
///
/// A slave never answers a state offer before it has absorbed the state
/// of every master it is connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncRole {
    #[default]
    #[display("master")]
    Master,
    #[display("slave")]
    Slave,
}

impl FromStr for SyncRole {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "master" => Ok(SyncRole::Master),
            "slave" => Ok(SyncRole::Slave),
            other => Err(ConnectorError::InvalidRole(other.to_string())),
        }
    }
}

/// Configuration for a [`Connector`](crate::Connector)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Local role
    pub role: SyncRole,
    /// Local protocol version
    pub protocol_version: u32,
    /// Ask for the untransformed log when our state vector is empty
    pub prefer_untransformed: bool,
    /// Relay live updates to peers that are mid-handshake
    pub forward_to_syncing_clients: bool,
    /// Re-broadcast delete operations received in updates
    pub forward_applied_operations: bool,
    /// Relay grace window
    pub sync_grace: Duration,
    /// Token presented to peers
    pub auth: Option<String>,
    /// Capacity of the peer event channel
    pub event_capacity: usize,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            role: SyncRole::Master,
            protocol_version: PROTOCOL_VERSION,
            prefer_untransformed: false,
            forward_to_syncing_clients: true,
            forward_applied_operations: false,
            sync_grace: DEFAULT_SYNC_GRACE,
            auth: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ConnectorConfig {
    /// Build a configuration from an optional role name
    ///
    /// An absent name means master.
    pub fn from_role_name(role: Option<&str>) -> Result<Self, ConnectorError> {
        let role = role.map(SyncRole::from_str).transpose()?.unwrap_or_default();
        Ok(Self::default().with_role(role))
    }

    pub fn with_role(mut self, role: SyncRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn with_prefer_untransformed(mut self, prefer: bool) -> Self {
        self.prefer_untransformed = prefer;
        self
    }

    pub fn with_forward_to_syncing_clients(mut self, forward: bool) -> Self {
        self.forward_to_syncing_clients = forward;
        self
    }

    pub fn with_forward_applied_operations(mut self, forward: bool) -> Self {
        self.forward_applied_operations = forward;
        self
    }

    pub fn with_sync_grace(mut self, grace: Duration) -> Self {
        self.sync_grace = grace;
        self
    }

    pub fn with_auth(mut self, token: impl Into<String>) -> Self {
        self.auth = Some(token.into());
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}
