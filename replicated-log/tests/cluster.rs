//! End-to-end tests: real replicas on localhost TCP, a real client, on-disk
//! storage.

use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use replicated_log::client::{self, ClientOptions, Mode};
use replicated_log::config::{
    BootstrapParameters, ClientConfig, ClientPeer, NodeConfig, NodePeer, RuntimeConfig,
};
use replicated_log::driver::{Replica, ReplicaConfig, ReplicaState};
use replicated_log::eventlog::{Event, read_events};
use replicated_log::handshake::Identity;

const NODES: u64 = 4;

/// Reserves distinct localhost ports by binding them all at once.
fn free_ports(n: usize) -> Result<Vec<u16>> {
    let listeners = (0..n)
        .map(|_| TcpListener::bind("127.0.0.1:0"))
        .collect::<std::io::Result<Vec<_>>>()?;
    listeners
        .iter()
        .map(|listener| Ok(listener.local_addr()?.port()))
        .collect()
}

struct Network {
    nodes: Vec<NodeConfig>,
    client: ClientConfig,
}

fn network() -> Result<Network> {
    let ports = free_ports(NODES as usize)?;
    let node_keys: Vec<Identity> = (0..NODES).map(|_| Identity::generate()).collect();
    let client_key = Identity::generate();

    let peers: Vec<NodePeer> = (0..NODES)
        .zip(&node_keys)
        .zip(&ports)
        .map(|((id, identity), port)| NodePeer {
            id,
            address: format!("127.0.0.1:{port}"),
            public_key: hex::encode(identity.public_key()),
        })
        .collect();
    let runtime = RuntimeConfig {
        tick_interval_ms: 20,
        heartbeat_ticks: 1,
        suspect_ticks: 5,
        epoch_change_timeout_ticks: 5,
        batch_size: 20,
    };

    let nodes = peers
        .iter()
        .zip(&node_keys)
        .map(|(peer, identity)| NodeConfig {
            id: peer.id,
            listen_address: peer.address.clone(),
            private_key: identity.to_hex(),
            runtime: runtime.clone(),
            bootstrap: BootstrapParameters::default(),
            nodes: peers.clone(),
            clients: vec![ClientPeer {
                id: 0,
                public_key: hex::encode(client_key.public_key()),
            }],
        })
        .collect();
    let client = ClientConfig {
        id: 0,
        private_key: client_key.to_hex(),
        nodes: peers,
    };
    Ok(Network { nodes, client })
}

struct Running {
    replica: Arc<Replica>,
    thread: JoinHandle<Result<()>>,
}

fn start(node: NodeConfig, root: &Path, parallel: bool) -> Running {
    let dir = root.join(format!("node{}", node.id));
    let replica = Arc::new(Replica::new(ReplicaConfig {
        node,
        wal_dir: dir.join("wal"),
        request_store_dir: dir.join("reqstore"),
        parallel,
        event_log: Some(dir.join("eventlog.gz")),
    }));
    let runner = Arc::clone(&replica);
    let thread = thread::spawn(move || runner.run());
    Running { replica, thread }
}

fn wait_for(timeout: Duration, what: &str, mut done: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while !done() {
        if Instant::now() > deadline {
            bail!("timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(20));
    }
    Ok(())
}

fn stop(running: Running) -> Result<()> {
    running.replica.stop();
    assert_eq!(running.replica.state(), ReplicaState::Stopped);
    running.thread.join().expect("replica thread panicked")
}

#[test]
fn test_four_nodes_apply_every_request_once() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let network = network()?;

    let running: Vec<Running> = network
        .nodes
        .iter()
        .cloned()
        .map(|node| {
            let parallel = node.id % 2 == 1;
            start(node, dir.path(), parallel)
        })
        .collect();
    wait_for(Duration::from_secs(10), "listeners", || {
        running.iter().all(|node| node.replica.listen_addr().is_some())
    })?;

    let options = ClientOptions {
        count: 100,
        request_size: 64,
        mode: Mode::Watermark,
        linger: Duration::from_millis(500),
    };
    let sent = client::run(&network.client, options)?;
    assert_eq!(sent, 100 * NODES);

    wait_for(Duration::from_secs(30), "all requests applied", || {
        running.iter().all(|node| node.replica.applied_count() == 100)
    })?;

    // Duplicates from the other three nodes never count twice.
    thread::sleep(Duration::from_millis(200));
    for node in &running {
        assert_eq!(node.replica.applied_count(), 100);
        assert_eq!(node.replica.state(), ReplicaState::Running);
    }

    for node in running {
        stop(node)?;
    }
    Ok(())
}

#[test]
fn test_restarted_node_replays_its_log() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let network = network()?;

    let running: Vec<Running> = network
        .nodes
        .iter()
        .cloned()
        .map(|node| start(node, dir.path(), false))
        .collect();
    wait_for(Duration::from_secs(10), "listeners", || {
        running.iter().all(|node| node.replica.listen_addr().is_some())
    })?;

    let options = ClientOptions {
        count: 30,
        request_size: 32,
        mode: Mode::Fixed,
        linger: Duration::from_millis(500),
    };
    client::run(&network.client, options)?;
    wait_for(Duration::from_secs(30), "all requests applied", || {
        running.iter().all(|node| node.replica.applied_count() == 30)
    })?;
    for node in running {
        stop(node)?;
    }

    // Alone, node 0 cannot commit anything new, but everything it had
    // committed is replayed from its WAL and request store.
    let restarted = start(network.nodes[0].clone(), dir.path(), false);
    wait_for(Duration::from_secs(10), "replay", || {
        restarted.replica.applied_count() == 30
    })?;
    stop(restarted)?;

    // The second run rewrote node 0's event log, replayed batches included.
    let events = read_events(dir.path().join("node0").join("eventlog.gz"))?;
    assert!(events.iter().any(|record| matches!(record.event, Event::Actions(_))));
    assert!(events.iter().any(|record| matches!(record.event, Event::Results(_))));
    Ok(())
}
