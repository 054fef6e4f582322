//! Pre-built sync scenarios

use std::fmt;
use std::time::Duration;

use anyhow::{Context, ensure};
use concord_core::{MockTransportBuilder, SimulationIdentity};
use concord_sync::{ConnectorConfig, PROTOCOL_VERSION, SyncRole};
use tokio::time::Instant;
use tracing::info;

use crate::{SimNode, wait_until};

/// How long any scenario waits for convergence
const SETTLE_LIMIT: Duration = Duration::from_secs(120);

/// Outcome of one named check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub name: String,
    pub passed: bool,
}

/// Summary of a scenario run
#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub name: &'static str,
    pub peers: usize,
    pub checks: Vec<Check>,
    pub elapsed: Duration,
}

impl ScenarioReport {
    fn new(name: &'static str, peers: usize) -> Self {
        Self {
            name,
            peers,
            checks: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    fn check(&mut self, name: impl Into<String>, passed: bool) {
        let name = name.into();
        info!(scenario = self.name, check = %name, passed, "check");
        self.checks.push(Check { name, passed });
    }

    pub fn passed(&self) -> bool {
        self.checks.iter().all(|check| check.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &Check> {
        self.checks.iter().filter(|check| !check.passed)
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "scenario: {} ({} peers)", self.name, self.peers)?;
        for check in &self.checks {
            let mark = if check.passed { "ok" } else { "FAIL" };
            writeln!(f, "  [{:>4}] {}", mark, check.name)?;
        }
        let verdict = if self.passed() { "passed" } else { "FAILED" };
        write!(f, "result: {} in {:.2?}", verdict, self.elapsed)
    }
}

fn config(role: SyncRole, grace: Duration) -> ConnectorConfig {
    ConnectorConfig::default()
        .with_role(role)
        .with_sync_grace(grace)
}

fn ident(c: char) -> anyhow::Result<SimulationIdentity> {
    SimulationIdentity::new(c).with_context(|| format!("invalid peer name {:?}", c))
}

/// A master and a slave with divergent state converge, then a live edit
/// from the slave reaches the master
pub async fn run_pair(grace: Duration) -> anyhow::Result<ScenarioReport> {
    let started = Instant::now();
    let mut report = ScenarioReport::new("pair", 2);

    let (server_id, client_id) = (ident('S')?, ident('C')?);
    let (server_transport, client_transport) =
        MockTransportBuilder::new().create_connected_pair(server_id, client_id);
    let server = SimNode::spawn(server_id, server_transport, config(SyncRole::Master, grace));
    let client = SimNode::spawn(client_id, client_transport, config(SyncRole::Slave, grace));

    server.seed("server draft");
    client.seed("client draft");

    server.meet(&client, SyncRole::Slave).await?;
    client.meet(&server, SyncRole::Master).await?;

    let synced = wait_until(SETTLE_LIMIT, || {
        server.connector.is_synced() && client.connector.is_synced()
    })
    .await;
    report.check("both peers finished their handshakes", synced);
    report.check(
        "replicas converged",
        server.sorted_contents() == client.sorted_contents() && server.replica.len() == 2,
    );

    client.edit("live edit");
    let delivered = wait_until(SETTLE_LIMIT, || {
        server.replica.contents().iter().any(|c| c == "live edit")
    })
    .await;
    report.check("live edit reached the master", delivered);

    report.elapsed = started.elapsed();
    Ok(report)
}

/// `peers` fully connected masters, each with one edit, converge
pub async fn run_mesh(peers: usize, grace: Duration) -> anyhow::Result<ScenarioReport> {
    ensure!((2..=26).contains(&peers), "mesh needs 2 to 26 peers, got {}", peers);
    let started = Instant::now();
    let mut report = ScenarioReport::new("mesh", peers);

    let ids: Vec<SimulationIdentity> = ('A'..='Z')
        .take(peers)
        .filter_map(SimulationIdentity::new)
        .collect();
    let mut transports = MockTransportBuilder::new().create_full_mesh(ids.clone());
    let mut nodes = Vec::with_capacity(peers);
    for id in &ids {
        let transport = transports
            .remove(id)
            .with_context(|| format!("no transport for {}", id))?;
        nodes.push(SimNode::spawn(*id, transport, config(SyncRole::Master, grace)));
    }

    for node in &nodes {
        node.seed(&format!("note from {}", node.id));
    }
    for node in &nodes {
        for peer in nodes.iter().filter(|peer| peer.id != node.id) {
            node.meet(peer, SyncRole::Master).await?;
        }
    }

    let synced = wait_until(SETTLE_LIMIT, || {
        nodes.iter().all(|node| node.connector.is_synced())
    })
    .await;
    report.check("every peer finished its handshakes", synced);

    let reference = nodes[0].sorted_contents();
    report.check(
        format!("every replica holds all {} notes", peers),
        reference.len() == peers && nodes.iter().all(|node| node.sorted_contents() == reference),
    );

    report.elapsed = started.elapsed();
    Ok(report)
}

/// A peer on an older protocol is refused; the others sync regardless
pub async fn run_skew(grace: Duration) -> anyhow::Result<ScenarioReport> {
    let started = Instant::now();
    let mut report = ScenarioReport::new("skew", 3);

    let ids = SimulationIdentity::range_to('C');
    let mut transports = MockTransportBuilder::new().create_full_mesh(ids.clone());
    let mut take = |id: &SimulationIdentity| {
        transports
            .remove(id)
            .with_context(|| format!("no transport for {}", id))
    };

    let a = SimNode::spawn(ids[0], take(&ids[0])?, config(SyncRole::Master, grace));
    let stale = config(SyncRole::Master, grace).with_protocol_version(PROTOCOL_VERSION - 1);
    let b = SimNode::spawn(ids[1], take(&ids[1])?, stale);
    let c = SimNode::spawn(ids[2], take(&ids[2])?, config(SyncRole::Master, grace));

    a.seed("from A");
    b.seed("from B");
    c.seed("from C");

    // The stale peer joins first, so it is everyone's first sync target.
    a.meet(&b, SyncRole::Master).await?;
    c.meet(&b, SyncRole::Master).await?;
    b.meet(&a, SyncRole::Master).await?;
    b.meet(&c, SyncRole::Master).await?;
    a.meet(&c, SyncRole::Master).await?;
    c.meet(&a, SyncRole::Master).await?;

    let converged = wait_until(SETTLE_LIMIT, || {
        a.replica.len() == 2 && c.replica.len() == 2
    })
    .await;
    report.check("current peers converged", converged && a.sorted_contents() == c.sorted_contents());

    let refused = wait_until(SETTLE_LIMIT, || {
        b.sent_kinds(&a).contains(&"sync stop") && a.sent_kinds(&b).contains(&"sync stop")
    })
    .await;
    report.check("stale peer and current peer refused each other", refused);

    // Give any stray traffic one more grace window to arrive.
    tokio::time::sleep(grace * 2).await;
    report.check(
        "stale peer kept only its own state",
        b.replica.contents() == vec!["from B".to_string()],
    );
    report.check(
        "no state crossed the version boundary",
        !a.replica.contents().iter().any(|c| c == "from B"),
    );
    report.check("stale peer never reports synced", !b.connector.is_synced());

    report.elapsed = started.elapsed();
    Ok(report)
}
