//! Multi-node replication tests.
//!
//! Each test node gets its own data directory and TCP listener with the
//! first-byte mux in front, the same wiring the agent uses in
//! production, minus the gRPC half.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use streamlog_cluster::{ClusterConfig, ClusterError, DistributedLog, RAFT_RPC};
use streamlog_proto::v1::Record;
use streamlog_storage::SegmentConfig;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

struct TestNode {
    name: String,
    addr: String,
    log: Arc<DistributedLog>,
    _dir: TempDir,
}

fn record(value: &str) -> Record {
    Record {
        value: Bytes::copy_from_slice(value.as_bytes()),
        ..Default::default()
    }
}

async fn start_node(name: &str, bootstrap: bool) -> TestNode {
    let dir = TempDir::new().expect("create temp dir");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();

    let (raft_tx, raft_rx) = mpsc::channel(16);
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let raft_tx = raft_tx.clone();
            tokio::spawn(async move {
                let mut sentinel = [0u8; 1];
                if stream.read_exact(&mut sentinel).await.is_ok() && sentinel[0] == RAFT_RPC {
                    let _ = raft_tx.send(stream).await;
                }
            });
        }
    });

    let config = ClusterConfig {
        node_name: name.to_string(),
        rpc_addr: addr.clone(),
        bootstrap,
        segment: SegmentConfig {
            max_store_bytes: 64 * 1024,
            max_index_bytes: 4096,
            initial_offset: 0,
        },
        ..Default::default()
    };
    let log = DistributedLog::new(dir.path(), config, raft_rx)
        .await
        .expect("start node");

    TestNode {
        name: name.to_string(),
        addr,
        log: Arc::new(log),
        _dir: dir,
    }
}

/// Poll a follower until the record at `offset` replicates over.
async fn await_record(node: &TestNode, offset: u64, deadline: Duration) -> Record {
    timeout(deadline, async {
        loop {
            match node.log.read(offset) {
                Ok(record) => return record,
                Err(_) => sleep(Duration::from_millis(50)).await,
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} never saw offset {offset}", node.name))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_append_and_read() {
    let node = start_node("solo-0", true).await;

    for (i, value) in ["a", "b", "c"].iter().enumerate() {
        let offset = node.log.append(record(value)).await.expect("append");
        assert_eq!(offset, i as u64);
    }

    assert_eq!(
        node.log.read(1).expect("read").value,
        Bytes::from_static(b"b")
    );
    assert_eq!(node.log.lowest_offset().expect("lowest"), 0);
    assert_eq!(node.log.highest_offset().expect("highest"), 2);

    node.log.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_nodes_replicate_appends() {
    let leader = start_node("repl-0", true).await;
    let follower_1 = start_node("repl-1", false).await;
    let follower_2 = start_node("repl-2", false).await;

    leader
        .log
        .join(&follower_1.name, &follower_1.addr)
        .await
        .expect("join follower 1");
    leader
        .log
        .join(&follower_2.name, &follower_2.addr)
        .await
        .expect("join follower 2");

    let offset = leader.log.append(record("x")).await.expect("append");
    assert_eq!(offset, 0);

    for follower in [&follower_1, &follower_2] {
        let got = await_record(follower, 0, Duration::from_secs(10)).await;
        assert_eq!(got.offset, 0);
        assert_eq!(got.value, Bytes::from_static(b"x"));
    }

    let servers = leader.log.get_servers().expect("get servers");
    assert_eq!(servers.len(), 3);
    assert_eq!(
        servers
            .iter()
            .filter(|s| s.is_leader)
            .map(|s| s.id.as_str())
            .collect::<Vec<_>>(),
        vec!["repl-0"]
    );

    for node in [leader, follower_1, follower_2] {
        node.log.close().await.expect("close");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn append_on_follower_reports_leader() {
    let leader = start_node("route-0", true).await;
    let follower = start_node("route-1", false).await;

    leader
        .log
        .join(&follower.name, &follower.addr)
        .await
        .expect("join");

    // Let the follower learn who leads before asserting on the hint.
    follower
        .log
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader known");

    match follower.log.append(record("nope")).await {
        Err(ClusterError::NotLeader { leader_addr }) => {
            assert_eq!(leader_addr.as_deref(), Some(leader.addr.as_str()));
        }
        other => panic!("expected NotLeader, got {other:?}"),
    }

    leader.log.close().await.expect("close");
    follower.log.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leave_shrinks_membership() {
    let leader = start_node("leave-0", true).await;
    let follower_1 = start_node("leave-1", false).await;
    let follower_2 = start_node("leave-2", false).await;

    leader
        .log
        .join(&follower_1.name, &follower_1.addr)
        .await
        .expect("join 1");
    leader
        .log
        .join(&follower_2.name, &follower_2.addr)
        .await
        .expect("join 2");
    assert_eq!(leader.log.get_servers().expect("servers").len(), 3);

    leader
        .log
        .leave(&follower_2.name)
        .await
        .expect("leave follower 2");

    let servers = leader.log.get_servers().expect("servers");
    let ids: Vec<&str> = servers.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["leave-0", "leave-1"]);

    // Replication still works with the remaining pair.
    let offset = leader.log.append(record("still-on")).await.expect("append");
    let got = await_record(&follower_1, offset, Duration::from_secs(10)).await;
    assert_eq!(got.value, Bytes::from_static(b"still-on"));

    for node in [leader, follower_1, follower_2] {
        node.log.close().await.expect("close");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_preserves_replicated_records() {
    let dir = TempDir::new().expect("create temp dir");

    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr").to_string();
        let (_raft_tx, raft_rx) = mpsc::channel(16);
        drop(listener);

        let config = ClusterConfig {
            node_name: "restart-0".to_string(),
            rpc_addr: addr,
            bootstrap: true,
            ..Default::default()
        };
        let log = DistributedLog::new(dir.path(), config, raft_rx)
            .await
            .expect("start node");
        for value in ["a", "b", "c"] {
            log.append(record(value)).await.expect("append");
        }
        log.close().await.expect("close");
    }

    {
        let (_raft_tx, raft_rx) = mpsc::channel(16);
        let config = ClusterConfig {
            node_name: "restart-0".to_string(),
            rpc_addr: "127.0.0.1:0".to_string(),
            bootstrap: true,
            ..Default::default()
        };
        let log = DistributedLog::new(dir.path(), config, raft_rx)
            .await
            .expect("restart node");

        // Committed records are still readable and not re-applied.
        assert_eq!(log.highest_offset().expect("highest"), 2);
        assert_eq!(log.read(2).expect("read").value, Bytes::from_static(b"c"));

        // The log keeps accepting appends after restart.
        log.wait_for_leader(Duration::from_secs(5))
            .await
            .expect("leader");
        let offset = log.append(record("d")).await.expect("append");
        assert_eq!(offset, 3);

        log.close().await.expect("close");
    }
}
