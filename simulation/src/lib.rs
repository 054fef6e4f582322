//! # Concord Simulation
//!
//! Runs several [`Connector`]s in one process over linked mock transports
//! and checks that their replicas converge.
//!
//! - **pair**: a master and a slave with divergent state, then a live edit
//! - **mesh**: `N` masters, fully connected
//! - **skew**: one peer speaks an older protocol version
//!
//! Each scenario returns a [`ScenarioReport`]. Scenarios use Tokio time, so
//! tests run them with paused time and the grace windows elapse instantly.

pub mod scenarios;

pub use scenarios::{Check, ScenarioReport, run_mesh, run_pair, run_skew};

use std::sync::Arc;
use std::time::Duration;

use concord_core::{MemoryReplica, MockTransport, SimulationIdentity};
use concord_logging::PeerContextGuard;
use concord_sync::{Connector, ConnectorConfig, ConnectorResult, HandshakeMessage, SyncRole};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// One simulated peer: replica, connector and its inbound pump
pub struct SimNode {
    pub id: SimulationIdentity,
    pub replica: Arc<MemoryReplica>,
    pub transport: Arc<MockTransport<SimulationIdentity>>,
    pub connector: Connector<SimulationIdentity>,
    pump: JoinHandle<ConnectorResult<()>>,
}

impl SimNode {
    /// Build a connector over `transport` and start pumping its inbox
    pub fn spawn(
        id: SimulationIdentity,
        transport: MockTransport<SimulationIdentity>,
        config: ConnectorConfig,
    ) -> Self {
        let span = {
            let _context = PeerContextGuard::new(&id);
            tracing::info_span!("node", node = %id)
        };

        let replica = Arc::new(MemoryReplica::new());
        let transport = Arc::new(transport);
        let connector = Connector::builder(replica.clone(), transport.clone())
            .with_config(config)
            .with_local_id(id)
            .build();

        let pump = tokio::spawn({
            let connector = connector.clone();
            async move { connector.run().await }.instrument(span)
        });

        Self {
            id,
            replica,
            transport,
            connector,
            pump,
        }
    }

    /// Introduce `peer` to this node
    pub async fn meet(&self, peer: &SimNode, role: SyncRole) -> ConnectorResult<()> {
        self.connector.user_joined(peer.id, Some(role)).await
    }

    /// Insert locally without telling anyone
    pub fn seed(&self, content: &str) {
        self.replica.insert(&self.id.to_string(), content);
    }

    /// Insert locally and broadcast the op
    pub fn edit(&self, content: &str) {
        let op = self.replica.insert(&self.id.to_string(), content);
        self.connector.broadcast_ops(&[op]);
    }

    pub fn sorted_contents(&self) -> Vec<String> {
        let mut contents = self.replica.contents();
        contents.sort();
        contents
    }

    /// Kinds of every message this node sent to `peer`
    pub fn sent_kinds(&self, peer: &SimNode) -> Vec<&'static str> {
        self.transport
            .sent_to(&peer.id)
            .iter()
            .filter_map(|frame| HandshakeMessage::from_bytes(frame).ok())
            .map(|message| message.kind())
            .collect()
    }
}

impl Drop for SimNode {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Poll `condition` every few milliseconds until it holds or `limit` passes
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
