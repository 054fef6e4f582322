//! Two live connectors talking over linked mock transports

use std::sync::Arc;
use std::time::Duration;

use concord_core::{MemoryReplica, MockTransportBuilder, SimulationIdentity};
use concord_sync::{Connector, ConnectorConfig, SyncRole};

struct Node {
    replica: Arc<MemoryReplica>,
    connector: Connector<SimulationIdentity>,
}

fn node(
    id: SimulationIdentity,
    transport: concord_core::MockTransport<SimulationIdentity>,
    role: SyncRole,
) -> Node {
    let replica = Arc::new(MemoryReplica::new());
    let connector = Connector::builder(replica.clone(), Arc::new(transport))
        .with_config(ConnectorConfig::default().with_role(role))
        .with_local_id(id)
        .build();
    tokio::spawn({
        let connector = connector.clone();
        async move { connector.run().await }
    });
    Node { replica, connector }
}

fn sorted(mut contents: Vec<String>) -> Vec<String> {
    contents.sort();
    contents
}

#[tokio::test(start_paused = true)]
async fn test_master_and_slave_converge() {
    let server_id = SimulationIdentity::new('S').unwrap();
    let client_id = SimulationIdentity::new('C').unwrap();
    let (server_transport, client_transport) =
        MockTransportBuilder::new().create_connected_pair(server_id, client_id);

    let server = node(server_id, server_transport, SyncRole::Master);
    let client = node(client_id, client_transport, SyncRole::Slave);

    server.replica.insert("server", "from server");
    client.replica.insert("client", "from client");

    server
        .connector
        .user_joined(client_id, Some(SyncRole::Slave))
        .await
        .unwrap();
    client
        .connector
        .user_joined(server_id, Some(SyncRole::Master))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(60), async {
        server.connector.synced().await;
        client.connector.synced().await;
    })
    .await
    .expect("both sides should finish their handshakes");

    let expected = vec!["from client".to_string(), "from server".to_string()];
    assert_eq!(sorted(server.replica.contents()), expected);
    assert_eq!(sorted(client.replica.contents()), expected);
    assert!(server.connector.peer_state(&client_id).unwrap().synced);
    assert!(client.connector.peer_state(&server_id).unwrap().synced);

    // Live edits flow after the handshake.
    let op = server.replica.insert("server", "live");
    server.connector.broadcast_ops(&[op]);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(client.replica.contents().contains(&"live".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_version_mismatch_never_syncs() {
    let a_id = SimulationIdentity::new('A').unwrap();
    let b_id = SimulationIdentity::new('B').unwrap();
    let (a_transport, b_transport) =
        MockTransportBuilder::new().create_connected_pair(a_id, b_id);

    let a = node(a_id, a_transport, SyncRole::Master);
    let b_replica = Arc::new(MemoryReplica::new());
    let b = Connector::builder(b_replica.clone(), Arc::new(b_transport))
        .with_config(ConnectorConfig::default().with_protocol_version(10))
        .with_local_id(b_id)
        .build();
    tokio::spawn({
        let b = b.clone();
        async move { b.run().await }
    });

    a.replica.insert("alice", "never shared");
    a.connector.user_joined(b_id, Some(SyncRole::Master)).await.unwrap();
    b.user_joined(a_id, Some(SyncRole::Master)).await.unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(!a.connector.is_synced());
    assert!(!b.is_synced());
    assert!(b_replica.is_empty());
}
