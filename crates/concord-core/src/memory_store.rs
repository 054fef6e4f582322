//! In-memory replica for tests and simulation
//!
//! [`MemoryReplica`] is a grow-only list of text inserts plus tombstones.
//! Work submitted through [`ReplicaStore`] goes into a FIFO transaction
//! queue. Normally the queue drains immediately; [`MemoryReplica::hold`]
//! parks it so tests can observe what happens while mutations are still
//! uncommitted, and [`MemoryReplica::release`] commits everything parked.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;
use tracing::trace;

use crate::error::{CodecError, StoreError};
use crate::store::{
    DELETE_STRUCT, DeleteSet, EncodedOp, OpId, OperationCodec, ReplicaStore, StateVector,
};

const INSERT_STRUCT: &str = "Insert";

/// Native operation type of [`MemoryReplica`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryOp {
    Insert { id: OpId, content: String },
    Delete { id: OpId, target: OpId },
}

impl MemoryOp {
    pub fn id(&self) -> &OpId {
        match self {
            MemoryOp::Insert { id, .. } | MemoryOp::Delete { id, .. } => id,
        }
    }
}

impl OperationCodec for MemoryOp {
    fn encode(&self) -> EncodedOp {
        match self {
            MemoryOp::Insert { id, content } => {
                EncodedOp::new(INSERT_STRUCT, id.clone()).with_field("content", content.as_str())
            }
            MemoryOp::Delete { id, target } => EncodedOp::new(DELETE_STRUCT, id.clone())
                .with_field("target", json!({ "user": target.user, "clock": target.clock })),
        }
    }

    fn decode(encoded: &EncodedOp) -> Result<Self, CodecError> {
        match encoded.kind.as_str() {
            INSERT_STRUCT => {
                let content = encoded
                    .field("content")?
                    .as_str()
                    .ok_or(CodecError::MissingField("content"))?;
                Ok(MemoryOp::Insert {
                    id: encoded.id.clone(),
                    content: content.to_string(),
                })
            }
            DELETE_STRUCT => {
                let target: OpId = serde_json::from_value(encoded.field("target")?.clone())?;
                Ok(MemoryOp::Delete {
                    id: encoded.id.clone(),
                    target,
                })
            }
            other => Err(CodecError::UnknownStruct(other.to_string())),
        }
    }
}

/// What one committed transaction did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalEntry {
    /// A batch of operations; the count excludes ops already seen
    Ops(usize),
    /// A delete set, by number of deleted clocks it carried
    DeleteSet(u64),
    /// A locally produced operation
    Local,
}

enum Transaction {
    Remote(Vec<MemoryOp>),
    DeleteSet(DeleteSet),
    Local(MemoryOp),
}

#[derive(Default)]
struct ReplicaState {
    log: Vec<MemoryOp>,
    state_vector: StateVector,
    deleted: DeleteSet,
    queue: VecDeque<Transaction>,
    held: bool,
    journal: Vec<JournalEntry>,
    gc_running: bool,
}

impl ReplicaState {
    fn integrate(&mut self, op: MemoryOp) -> bool {
        if self.state_vector.includes(op.id()) {
            return false;
        }
        if let MemoryOp::Delete { target, .. } = &op {
            self.deleted.insert(&target.user, target.clock);
        }
        let id = op.id();
        self.state_vector.advance(&id.user, id.clock + 1);
        self.log.push(op);
        true
    }

    fn commit(&mut self, transaction: Transaction) {
        let entry = match transaction {
            Transaction::Remote(ops) => {
                let applied = ops
                    .into_iter()
                    .map(|op| self.integrate(op))
                    .filter(|new| *new)
                    .count();
                JournalEntry::Ops(applied)
            }
            Transaction::DeleteSet(ds) => {
                self.deleted.merge(&ds);
                JournalEntry::DeleteSet(ds.deleted_count())
            }
            Transaction::Local(op) => {
                self.integrate(op);
                JournalEntry::Local
            }
        };
        self.journal.push(entry);
    }
}

/// In-memory replica store with a holdable commit queue
pub struct MemoryReplica {
    state: Mutex<ReplicaState>,
    /// Number of queued, uncommitted transactions
    pending: watch::Sender<usize>,
}

impl Default for MemoryReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryReplica {
    pub fn new() -> Self {
        let (pending, _) = watch::channel(0);
        Self {
            state: Mutex::new(ReplicaState::default()),
            pending,
        }
    }

    fn submit(&self, transaction: Transaction) {
        let mut state = self.state.lock();
        state.queue.push_back(transaction);
        if !state.held {
            Self::drain(&mut state);
        }
        self.pending.send_replace(state.queue.len());
    }

    fn drain(state: &mut ReplicaState) {
        while let Some(transaction) = state.queue.pop_front() {
            state.commit(transaction);
        }
    }

    /// Park the commit queue; submitted work stays uncommitted
    pub fn hold(&self) {
        self.state.lock().held = true;
    }

    /// Commit everything parked and resume immediate commits
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.held = false;
        Self::drain(&mut state);
        trace!(journal = state.journal.len(), "replica queue released");
        self.pending.send_replace(0);
    }

    /// Number of transactions waiting to commit
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Create and queue a local insert
    pub fn insert(&self, user: &str, content: &str) -> MemoryOp {
        let op = {
            let state = self.state.lock();
            let clock = Self::next_clock(&state, user);
            MemoryOp::Insert {
                id: OpId::new(user, clock),
                content: content.to_string(),
            }
        };
        self.submit(Transaction::Local(op.clone()));
        op
    }

    /// Create and queue a local delete of `target`
    pub fn delete(&self, user: &str, target: OpId) -> MemoryOp {
        let op = {
            let state = self.state.lock();
            let clock = Self::next_clock(&state, user);
            MemoryOp::Delete {
                id: OpId::new(user, clock),
                target,
            }
        };
        self.submit(Transaction::Local(op.clone()));
        op
    }

    fn next_clock(state: &ReplicaState, user: &str) -> u64 {
        // Uncommitted local ops still reserve their clocks.
        let queued = state
            .queue
            .iter()
            .filter(|t| matches!(t, Transaction::Local(op) if op.id().user == user))
            .count() as u64;
        state.state_vector.get(user) + queued
    }

    /// Visible insert contents, in log order
    pub fn contents(&self) -> Vec<String> {
        let state = self.state.lock();
        state
            .log
            .iter()
            .filter_map(|op| match op {
                MemoryOp::Insert { id, content } if !state.deleted.contains(&id.user, id.clock) => {
                    Some(content.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Number of committed operations
    pub fn len(&self) -> usize {
        self.state.lock().log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Committed transactions, in commit order
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.state.lock().journal.clone()
    }

    pub fn gc_running(&self) -> bool {
        self.state.lock().gc_running
    }

    fn decode_all(ops: &[EncodedOp]) -> Result<Vec<MemoryOp>, StoreError> {
        ops.iter()
            .map(|op| MemoryOp::decode(op).map_err(StoreError::from))
            .collect()
    }
}

#[async_trait]
impl ReplicaStore for MemoryReplica {
    async fn state_vector(&self) -> StateVector {
        self.state.lock().state_vector.clone()
    }

    async fn delete_set(&self) -> DeleteSet {
        self.state.lock().deleted.clone()
    }

    async fn ops_since(&self, state_vector: &StateVector) -> Result<Vec<EncodedOp>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .log
            .iter()
            .filter(|op| !state_vector.includes(op.id()))
            .map(OperationCodec::encode)
            .collect())
    }

    async fn full_operation_log(&self) -> Result<Vec<EncodedOp>, StoreError> {
        Ok(self.state.lock().log.iter().map(OperationCodec::encode).collect())
    }

    async fn apply_ops(&self, ops: Vec<EncodedOp>) -> Result<(), StoreError> {
        let ops = Self::decode_all(&ops)?;
        self.submit(Transaction::Remote(ops));
        Ok(())
    }

    async fn apply_delete_set(&self, delete_set: DeleteSet) -> Result<(), StoreError> {
        self.submit(Transaction::DeleteSet(delete_set));
        Ok(())
    }

    async fn when_committed(&self) -> Result<(), StoreError> {
        let mut pending = self.pending.subscribe();
        pending
            .wait_for(|queued| *queued == 0)
            .await
            .map(|_| ())
            .map_err(|_| StoreError::Closed)
    }

    async fn start_garbage_collector(&self) {
        self.state.lock().gc_running = true;
    }

    async fn stop_garbage_collector(&self) {
        self.state.lock().gc_running = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_local_ops_advance_state_vector() {
        let replica = MemoryReplica::new();
        replica.insert("alice", "a");
        replica.insert("alice", "b");

        let sv = replica.state_vector().await;
        assert_eq!(sv.get("alice"), 2);
        assert_eq!(replica.contents(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_ops_since_returns_missing_ops() {
        let source = MemoryReplica::new();
        source.insert("alice", "a");
        source.insert("alice", "b");
        source.insert("bob", "c");

        let mut seen = StateVector::new();
        seen.advance("alice", 1);
        let missing = source.ops_since(&seen).await.unwrap();
        assert_eq!(missing.len(), 2);
        assert_eq!(missing[0].id, OpId::new("alice", 1));

        let target = MemoryReplica::new();
        target.apply_ops(source.full_operation_log().await.unwrap()).await.unwrap();
        assert_eq!(target.contents(), vec!["a", "b", "c"]);
        assert_eq!(target.journal(), vec![JournalEntry::Ops(3)]);
    }

    #[tokio::test]
    async fn test_duplicate_remote_ops_are_skipped() {
        let source = MemoryReplica::new();
        source.insert("alice", "a");
        let log = source.full_operation_log().await.unwrap();

        let target = MemoryReplica::new();
        target.apply_ops(log.clone()).await.unwrap();
        target.apply_ops(log).await.unwrap();
        assert_eq!(target.len(), 1);
        assert_eq!(target.journal(), vec![JournalEntry::Ops(1), JournalEntry::Ops(0)]);
    }

    #[tokio::test]
    async fn test_delete_op_tombstones_target() {
        let replica = MemoryReplica::new();
        let first = replica.insert("alice", "a");
        replica.insert("alice", "b");
        let delete = replica.delete("bob", first.id().clone());

        assert!(delete.encode().is_delete());
        assert_eq!(replica.contents(), vec!["b"]);
        assert!(replica.delete_set().await.contains("alice", 0));
    }

    #[tokio::test]
    async fn test_hold_defers_commit() {
        let replica = Arc::new(MemoryReplica::new());
        replica.hold();
        replica.insert("alice", "a");
        replica.insert("alice", "b");
        assert_eq!(replica.pending(), 2);
        assert!(replica.is_empty());

        let waiter = {
            let replica = replica.clone();
            tokio::spawn(async move { replica.when_committed().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        replica.release();
        waiter.await.unwrap().unwrap();
        assert_eq!(replica.contents(), vec!["a", "b"]);
        assert_eq!(replica.state_vector().await.get("alice"), 2);
    }

    #[test]
    fn test_decode_rejects_unknown_struct() {
        let op = EncodedOp::new("Frobnicate", OpId::new("alice", 0));
        assert!(matches!(
            MemoryOp::decode(&op),
            Err(CodecError::UnknownStruct(kind)) if kind == "Frobnicate"
        ));

        let op = EncodedOp::new(DELETE_STRUCT, OpId::new("alice", 0));
        assert!(matches!(MemoryOp::decode(&op), Err(CodecError::MissingField("target"))));
    }

    #[tokio::test]
    async fn test_garbage_collector_toggle() {
        let replica = MemoryReplica::new();
        replica.start_garbage_collector().await;
        assert!(replica.gc_running());
        replica.stop_garbage_collector().await;
        assert!(!replica.gc_running());
    }
}
