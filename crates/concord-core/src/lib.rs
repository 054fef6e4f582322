//! # Concord Core
//!
//! Core traits, types, and errors for the Concord replication stack.
//!
//! The connector in `concord-sync` never talks to a socket, a CRDT, or the
//! wall clock directly. Everything it needs from the outside world is
//! expressed here as a trait so the same handshake logic runs against real
//! collaborators and against the in-memory doubles used by the tests and the
//! simulation.
//!
//! ## Key Traits
//!
//! - [`PeerIdentity`]: Abstraction over peer identification
//! - [`Transport`]: Fire-and-forget frame delivery between peers
//! - [`ReplicaStore`]: The CRDT replica the connector reconciles
//! - [`OperationCodec`]: Conversion between native ops and [`EncodedOp`]
//! - [`Clock`]: Time abstraction for testability
//!
//! ## Test Doubles
//!
//! - [`MockTransport`]: Channel-backed transport with a frame log
//! - [`MemoryReplica`]: In-memory replica with a holdable commit queue
//! - [`ManualClock`]: Clock that only moves when told to

pub mod clock;
pub mod error;
pub mod identity;
pub mod memory_store;
pub mod mock_transport;
pub mod store;
pub mod transport;

pub use clock::*;
pub use error::*;
pub use identity::*;
pub use memory_store::*;
pub use mock_transport::*;
pub use store::*;
pub use transport::*;
