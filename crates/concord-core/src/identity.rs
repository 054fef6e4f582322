//! Peer identity abstractions
//!
//! The connector keys every peer record by an opaque, comparable identity.
//! This module provides the [`PeerIdentity`] trait plus two implementations:
//!
//! - [`SimulationIdentity`]: Single-letter identity for tests ('A'..'Z')
//! - [`NodeId`]: UUID-backed identity for real deployments

use std::fmt::{Debug, Display};
use std::hash::Hash;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IdentityError;

/// Trait for peer identity abstraction
///
/// Identities are supplied by the transport alongside each inbound frame,
/// never by the message payload itself.
pub trait PeerIdentity:
    Clone + Eq + Hash + Send + Sync + Debug + Display + Serialize + DeserializeOwned + 'static
{
    /// Get the identity as bytes
    fn as_bytes(&self) -> Vec<u8>;

    /// Create an identity from bytes
    fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError>;

    /// Get a short display form (for logging)
    fn short_id(&self) -> String {
        format!("{}", self)
    }
}

/// Identities that can be minted locally when none is supplied
pub trait GenerateIdentity: PeerIdentity {
    /// Produce a fresh identity, unique with overwhelming probability
    fn generate() -> Self;
}

/// Simple character-based identity for simulation
///
/// Used for testing and development. Maps to characters 'A'..'Z'.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SimulationIdentity(pub char);

impl SimulationIdentity {
    /// Create a new simulation identity from a capital letter
    pub fn new(c: char) -> Option<Self> {
        if c.is_ascii_uppercase() {
            Some(Self(c))
        } else {
            None
        }
    }

    /// Generate all identities from 'A' to the given letter (inclusive)
    pub fn range_to(end: char) -> Vec<Self> {
        ('A'..=end).filter_map(Self::new).collect()
    }

    /// Get the underlying character
    pub fn as_char(&self) -> char {
        self.0
    }
}

impl Display for SimulationIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PeerIdentity for SimulationIdentity {
    fn as_bytes(&self) -> Vec<u8> {
        vec![self.0 as u8]
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        if bytes.len() != 1 {
            return Err(IdentityError::InvalidKeyLength {
                expected: 1,
                actual: bytes.len(),
            });
        }
        let c = bytes[0] as char;
        Self::new(c).ok_or_else(|| {
            IdentityError::InvalidFormat(format!("Invalid simulation identity: {}", c))
        })
    }

    fn short_id(&self) -> String {
        self.0.to_string()
    }
}

/// UUID-backed node identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Wrap an existing UUID
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PeerIdentity for NodeId {
    fn as_bytes(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        Uuid::from_slice(bytes)
            .map(Self)
            .map_err(|_| IdentityError::InvalidKeyLength {
                expected: 16,
                actual: bytes.len(),
            })
    }

    fn short_id(&self) -> String {
        hex::encode(&self.0.as_bytes()[..4])
    }
}

impl GenerateIdentity for NodeId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}
