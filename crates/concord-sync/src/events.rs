//! Peer lifecycle events

use serde::{Deserialize, Serialize};

use crate::config::SyncRole;
use crate::permission::Permission;

/// Events published to [`Connector::subscribe`](crate::Connector::subscribe) receivers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum UserEvent<I> {
    /// A peer connection was registered
    #[serde(rename = "userJoined")]
    Joined { peer: I, role: SyncRole },

    /// A peer connection was removed
    #[serde(rename = "userLeft")]
    Left { peer: I },

    /// A peer's presented token was resolved
    #[serde(rename = "userAuthenticated")]
    Authenticated { peer: I, permission: Permission },
}

impl<I> UserEvent<I> {
    /// Peer the event is about
    pub fn peer(&self) -> &I {
        match self {
            UserEvent::Joined { peer, .. }
            | UserEvent::Left { peer }
            | UserEvent::Authenticated { peer, .. } => peer,
        }
    }
}
