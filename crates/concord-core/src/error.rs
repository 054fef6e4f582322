//! Error types shared across the Concord stack

use thiserror::Error;

/// Errors related to peer identity
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Invalid identity format: {0}")]
    InvalidFormat(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
}

/// Errors related to frame delivery
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Peer not connected: {0}")]
    PeerNotConnected(String),
}

/// Errors reported by a replica store when a unit of work is refused
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Transaction rejected: {0}")]
    Rejected(String),

    #[error("Replica store is closed")]
    Closed,

    #[error("Undecodable operation: {0}")]
    Codec(#[from] CodecError),
}

/// Errors raised while decoding an encoded operation back into a native op
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Unknown operation struct: {0}")]
    UnknownStruct(String),

    #[error("Missing field in encoded operation: {0}")]
    MissingField(&'static str),

    #[error("Malformed operation field: {0}")]
    Json(#[from] serde_json::Error),
}
