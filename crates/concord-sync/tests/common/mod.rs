//! Shared fixtures for connector integration tests
//!
//! The node under test is `A`, the hub of a mock star. Every other identity
//! is a spoke that the test drives by hand: frames "from" a spoke are fed
//! straight into [`Connector::receive_message`], and whatever `A` sends is
//! read back from the hub transport's sent log.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use concord_core::{
    DeleteSet, EncodedOp, ManualClock, MemoryOp, MemoryReplica, MockTransport,
    MockTransportBuilder, OpId, OperationCodec, SimulationIdentity, StateVector,
};
use concord_sync::{
    AllowAll, AuthProvider, Connector, ConnectorConfig, HandshakeMessage, PROTOCOL_VERSION,
};

pub type Id = SimulationIdentity;

pub fn id(c: char) -> Id {
    SimulationIdentity::new(c).unwrap()
}

pub struct Harness {
    pub local: Id,
    pub replica: Arc<MemoryReplica>,
    pub clock: ManualClock,
    pub transport: Arc<MockTransport<Id>>,
    /// Kept alive so the hub's links stay open
    pub spokes: HashMap<Id, MockTransport<Id>>,
    pub connector: Connector<Id, ManualClock>,
}

impl Harness {
    /// Node `A` with spokes `B..=last`
    pub fn new(last: char, config: ConnectorConfig) -> Self {
        Self::with_auth(last, config, Arc::new(AllowAll))
    }

    pub fn with_auth(last: char, config: ConnectorConfig, auth: Arc<dyn AuthProvider<Id>>) -> Self {
        let local = id('A');
        let spoke_ids: Vec<Id> = SimulationIdentity::range_to(last)
            .into_iter()
            .filter(|peer| *peer != local)
            .collect();

        let mut spokes = MockTransportBuilder::new().create_star(local, spoke_ids);
        let transport = Arc::new(spokes.remove(&local).unwrap());
        let replica = Arc::new(MemoryReplica::new());
        let clock = ManualClock::new();

        let connector = Connector::builder(replica.clone(), transport.clone())
            .with_config(config)
            .with_shared_auth(auth)
            .with_clock(clock.clone())
            .with_local_id(local)
            .build();

        Self {
            local,
            replica,
            clock,
            transport,
            spokes,
            connector,
        }
    }

    /// Everything `A` has sent to `peer`, decoded
    pub fn sent_to(&self, peer: Id) -> Vec<HandshakeMessage> {
        self.transport
            .sent_to(&peer)
            .iter()
            .map(|frame| HandshakeMessage::from_bytes(frame).unwrap())
            .collect()
    }

    pub fn kinds_to(&self, peer: Id) -> Vec<&'static str> {
        self.sent_to(peer).iter().map(HandshakeMessage::kind).collect()
    }

    /// Ops of every `update` sent to `peer`, one entry per message
    pub fn updates_to(&self, peer: Id) -> Vec<Vec<EncodedOp>> {
        self.sent_to(peer)
            .into_iter()
            .filter_map(|msg| match msg {
                HandshakeMessage::Update { ops } => Some(ops),
                _ => None,
            })
            .collect()
    }

    pub fn clear_sent(&self) {
        self.transport.clear_sent();
    }

    /// Feed `peer` a complete phase 2 followed by done
    pub async fn complete_sync_with(&self, peer: Id) {
        self.connector
            .receive_message(&peer, step_two(Vec::new()))
            .await
            .unwrap();
        self.connector
            .receive_message(&peer, HandshakeMessage::Done)
            .await
            .unwrap();
    }
}

/// Let spawned tasks run to their next suspension point
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

pub fn offer(state_set: StateVector) -> HandshakeMessage {
    HandshakeMessage::VersionOffer {
        state_set,
        protocol_version: PROTOCOL_VERSION,
        auth: None,
        prefer_untransformed: false,
    }
}

pub fn offer_with_auth(token: &str) -> HandshakeMessage {
    HandshakeMessage::VersionOffer {
        state_set: StateVector::new(),
        protocol_version: PROTOCOL_VERSION,
        auth: Some(token.to_string()),
        prefer_untransformed: false,
    }
}

pub fn step_two(ops: Vec<EncodedOp>) -> HandshakeMessage {
    step_two_with_deletes(ops, DeleteSet::default())
}

pub fn step_two_with_deletes(ops: Vec<EncodedOp>, delete_set: DeleteSet) -> HandshakeMessage {
    let state_set = ops
        .iter()
        .map(|op| (op.id.user.clone(), op.id.clock + 1))
        .collect();
    HandshakeMessage::StateAndOps {
        state_set,
        delete_set,
        protocol_version: PROTOCOL_VERSION,
        auth: None,
        os: Some(ops),
        os_untransformed: None,
    }
}

pub fn insert(user: &str, clock: u64, content: &str) -> EncodedOp {
    MemoryOp::Insert {
        id: OpId::new(user, clock),
        content: content.to_string(),
    }
    .encode()
}

pub fn delete(user: &str, clock: u64, target: OpId) -> EncodedOp {
    MemoryOp::Delete {
        id: OpId::new(user, clock),
        target,
    }
    .encode()
}
