//! Replica store abstractions
//!
//! The connector reconciles replicas without knowing how the CRDT works.
//! It only needs to read a summary of what the local replica has seen, ask
//! for the operations a peer is missing, and submit batches back for
//! application. All of that goes through [`ReplicaStore`].
//!
//! ## Wire-level data
//!
//! - [`StateVector`]: per-user count of operations already seen
//! - [`DeleteSet`]: tombstoned operation ranges per user
//! - [`EncodedOp`]: a codec-neutral operation with its type tag and id

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, StoreError};

/// Type tag carried by delete operations
pub const DELETE_STRUCT: &str = "Delete";

/// Per-user summary of which operations a replica has already seen
///
/// For each user the vector stores the next expected clock, so an empty
/// vector means the replica has seen nothing at all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateVector(BTreeMap<String, u64>);

impl StateVector {
    /// Create an empty state vector
    pub fn new() -> Self {
        Self::default()
    }

    /// Next expected clock for a user (0 if unseen)
    pub fn get(&self, user: &str) -> u64 {
        self.0.get(user).copied().unwrap_or(0)
    }

    /// Raise the clock for a user; lower values are ignored
    pub fn advance(&mut self, user: &str, next_clock: u64) {
        let entry = self.0.entry(user.to_string()).or_insert(0);
        *entry = (*entry).max(next_clock);
    }

    /// Whether an operation id is already covered
    pub fn includes(&self, id: &OpId) -> bool {
        id.clock < self.get(&id.user)
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|clock| *clock == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &u64)> {
        self.0.iter()
    }
}

impl FromIterator<(String, u64)> for StateVector {
    fn from_iter<T: IntoIterator<Item = (String, u64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A contiguous run of deleted clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedRange {
    pub clock: u64,
    pub len: u64,
}

impl DeletedRange {
    fn end(&self) -> u64 {
        self.clock + self.len
    }
}

/// Tombstones, reconciled separately from operation application
///
/// Ranges for each user are kept sorted and non-overlapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeleteSet(BTreeMap<String, Vec<DeletedRange>>);

impl DeleteSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a single clock of a user as deleted
    pub fn insert(&mut self, user: &str, clock: u64) {
        self.insert_range(user, DeletedRange { clock, len: 1 });
    }

    /// Mark a range as deleted, merging with touching ranges
    pub fn insert_range(&mut self, user: &str, range: DeletedRange) {
        if range.len == 0 {
            return;
        }
        let ranges = self.0.entry(user.to_string()).or_default();
        ranges.push(range);
        ranges.sort_by_key(|r| r.clock);

        let mut merged: Vec<DeletedRange> = Vec::with_capacity(ranges.len());
        for r in ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if r.clock <= last.end() => {
                    last.len = last.end().max(r.end()) - last.clock;
                }
                _ => merged.push(r),
            }
        }
        *ranges = merged;
    }

    /// Whether a clock of a user is deleted
    pub fn contains(&self, user: &str, clock: u64) -> bool {
        self.0
            .get(user)
            .is_some_and(|ranges| ranges.iter().any(|r| r.clock <= clock && clock < r.end()))
    }

    /// Union another delete set into this one
    pub fn merge(&mut self, other: &DeleteSet) {
        for (user, ranges) in &other.0 {
            for range in ranges {
                self.insert_range(user, *range);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    /// Number of deleted clocks across all users
    pub fn deleted_count(&self) -> u64 {
        self.0.values().flatten().map(|r| r.len).sum()
    }
}

/// Globally unique operation id
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub user: String,
    pub clock: u64,
}

impl OpId {
    pub fn new(user: impl Into<String>, clock: u64) -> Self {
        Self {
            user: user.into(),
            clock,
        }
    }
}

/// An operation in its codec-neutral form
///
/// `kind` is the type tag (`struct` on the wire). Every field other than
/// the tag and the id is kept verbatim in `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedOp {
    #[serde(rename = "struct")]
    pub kind: String,
    pub id: OpId,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl EncodedOp {
    pub fn new(kind: impl Into<String>, id: OpId) -> Self {
        Self {
            kind: kind.into(),
            id,
            fields: serde_json::Map::new(),
        }
    }

    /// Attach a field
    pub fn with_field(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    /// Whether this is a delete-typed operation
    pub fn is_delete(&self) -> bool {
        self.kind == DELETE_STRUCT
    }

    /// Look up a field or report it missing
    pub fn field(&self, name: &'static str) -> Result<&serde_json::Value, CodecError> {
        self.fields.get(name).ok_or(CodecError::MissingField(name))
    }
}

/// Conversion between a store's native operation type and [`EncodedOp`]
pub trait OperationCodec: Sized {
    fn encode(&self) -> EncodedOp;

    fn decode(encoded: &EncodedOp) -> Result<Self, CodecError>;
}

/// The CRDT replica reconciled by the connector
///
/// Every `apply_*` call submits one unit of work to the store's serializing
/// transaction queue and returns once it is queued. [`when_committed`]
/// resolves once everything queued so far has been committed.
///
/// [`when_committed`]: ReplicaStore::when_committed
#[async_trait]
pub trait ReplicaStore: Send + Sync {
    /// Current state vector of the local replica
    async fn state_vector(&self) -> StateVector;

    /// Current delete set of the local replica
    async fn delete_set(&self) -> DeleteSet;

    /// Operations not covered by the given state vector, in causal order
    async fn ops_since(&self, state_vector: &StateVector) -> Result<Vec<EncodedOp>, StoreError>;

    /// The complete operation history, without diff computation
    async fn full_operation_log(&self) -> Result<Vec<EncodedOp>, StoreError>;

    /// Queue a batch of remote operations for application
    async fn apply_ops(&self, ops: Vec<EncodedOp>) -> Result<(), StoreError>;

    /// Queue an untransformed operation log sent by a peer whose state
    /// vector was `state_vector` when it produced the log
    async fn apply_untransformed(
        &self,
        ops: Vec<EncodedOp>,
        _state_vector: &StateVector,
    ) -> Result<(), StoreError> {
        self.apply_ops(ops).await
    }

    /// Queue application of a remote delete set
    async fn apply_delete_set(&self, delete_set: DeleteSet) -> Result<(), StoreError>;

    /// Wait until every unit of work queued so far has committed
    async fn when_committed(&self) -> Result<(), StoreError>;

    async fn start_garbage_collector(&self) {}

    async fn stop_garbage_collector(&self) {}
}
