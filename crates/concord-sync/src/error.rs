//! Error types for concord-sync

use concord_core::{StoreError, TransportError};
use concord_wire::WireError;
use thiserror::Error;

/// Errors surfaced by the connector
///
/// Traffic that fails the permission gate is not an error; it is dropped.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Invalid role: {0:?} (expected \"master\" or \"slave\")")]
    InvalidRole(String),

    #[error("Peer already joined: {0}")]
    AlreadyJoined(String),

    #[error("Incompatible protocol version: local {local}, remote {remote}")]
    IncompatibleProtocolVersion { local: u32, remote: u32 },

    #[error("Unable to deliver message from {0}")]
    DeliveryFailure(String),

    #[error("Wire encoding error: {0}")]
    Wire(#[from] WireError),

    #[error("Replica store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Result type for connector operations
pub type ConnectorResult<T> = Result<T, ConnectorError>;
