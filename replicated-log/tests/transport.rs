//! Transport behaviour over real localhost TCP connections.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{Sender, unbounded};
use replicated_log::directory::{PeerClass, PeerDirectory, PeerRecord};
use replicated_log::handler::{Handlers, InboundMessage, MessageHandler};
use replicated_log::handshake::Identity;
use replicated_log::transport::{Transport, TransportConfig, TransportError};

/// Echoes request payloads reversed and records every message.
struct Echo {
    seen: Sender<InboundMessage>,
}

impl MessageHandler for Echo {
    fn handle(&self, msg: InboundMessage) -> Result<Vec<u8>> {
        let reply = msg.payload.iter().rev().copied().collect();
        self.seen.send(msg)?;
        Ok(reply)
    }
}

struct Pair {
    server: Transport,
    client: Transport,
    seen: crossbeam_channel::Receiver<InboundMessage>,
}

/// Starts node 0 on an ephemeral port and builds client 7 pointed at it.
/// `known_client` controls whether the node's directory lists the client.
fn pair(known_client: bool) -> Result<Pair> {
    let node_identity = Identity::generate();
    let client_identity = Identity::generate();
    let node_key = node_identity.public_key();
    let client_key = client_identity.public_key();

    let clients = if known_client {
        vec![PeerRecord::client(7, client_key)]
    } else {
        vec![]
    };
    let server = Transport::new(TransportConfig {
        id: 0,
        class: PeerClass::Node,
        listen: Some("127.0.0.1:0".to_string()),
        identity: node_identity,
        directory: Arc::new(PeerDirectory::new(
            vec![PeerRecord::node(0, "127.0.0.1:1", node_key)],
            clients,
        )?),
    });
    let (tx, seen) = unbounded();
    let echo: Arc<dyn MessageHandler> = Arc::new(Echo { seen: tx });
    server.handle(Handlers::new(Arc::clone(&echo), Some(echo)));
    server.start()?;
    let addr = server.local_addr().expect("server is listening");

    let client = Transport::new(TransportConfig {
        id: 7,
        class: PeerClass::Client,
        listen: None,
        identity: client_identity,
        directory: Arc::new(PeerDirectory::new(
            vec![PeerRecord::node(0, addr.to_string(), node_key)],
            vec![],
        )?),
    });
    client.start()?;

    Ok(Pair {
        server,
        client,
        seen,
    })
}

#[test]
fn test_request_gets_matching_response() -> Result<()> {
    let pair = pair(true)?;

    for round in 0..3u8 {
        let response = pair.client.request(0, vec![round, 1, 2])?;
        assert_eq!(response, vec![2, 1, round]);
    }

    let msg = pair.seen.recv_timeout(Duration::from_secs(2))?;
    assert_eq!(msg.sender, 7);
    assert_eq!(msg.class, PeerClass::Client);
    assert!(msg.is_request);
    Ok(())
}

#[test]
fn test_send_is_delivered_with_sender_identity() -> Result<()> {
    let pair = pair(true)?;

    pair.client.send(0, b"hello".to_vec())?;
    let msg = pair.seen.recv_timeout(Duration::from_secs(2))?;
    assert_eq!(msg.sender, 7);
    assert_eq!(msg.class, PeerClass::Client);
    assert_eq!(msg.payload, b"hello");
    assert!(!msg.is_request);
    Ok(())
}

#[test]
fn test_unknown_sender_is_rejected() -> Result<()> {
    let pair = pair(false)?;

    let err = pair.client.request(0, vec![1]).unwrap_err();
    match err {
        TransportError::Rejected { dest, reason } => {
            assert_eq!(dest, 0);
            assert_eq!(reason, "unknown sender");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(pair.seen.recv_timeout(Duration::from_millis(200)).is_err());
    Ok(())
}

#[test]
fn test_closed_transport_refuses_traffic() -> Result<()> {
    let pair = pair(true)?;
    pair.client.close();
    assert!(matches!(
        pair.client.send(0, vec![1]),
        Err(TransportError::Closed)
    ));
    pair.server.close();
    pair.server.close();
    Ok(())
}

#[test]
fn test_send_to_silent_peer_does_not_block() -> Result<()> {
    // Accepts TCP connections at the kernel level but never answers the
    // handshake.
    let silent = std::net::TcpListener::bind("127.0.0.1:0")?;
    let silent_addr = silent.local_addr()?;

    let identity = Identity::generate();
    let own_key = identity.public_key();
    let transport = Transport::new(TransportConfig {
        id: 0,
        class: PeerClass::Node,
        listen: None,
        identity,
        directory: Arc::new(PeerDirectory::new(
            vec![
                PeerRecord::node(0, "127.0.0.1:1", own_key),
                PeerRecord::node(1, silent_addr.to_string(), Identity::generate().public_key()),
            ],
            vec![],
        )?),
    });
    let (tx, seen) = unbounded();
    let echo: Arc<dyn MessageHandler> = Arc::new(Echo { seen: tx });
    transport.handle(Handlers::new(echo, None));
    transport.start()?;

    let started = Instant::now();
    for round in 0..50u8 {
        transport.send(1, vec![round])?;
    }
    assert!(started.elapsed() < Duration::from_secs(1));

    // Other destinations keep flowing while the writer for node 1 is stuck.
    transport.send(0, b"self".to_vec())?;
    assert_eq!(seen.recv_timeout(Duration::from_secs(1))?.payload, b"self");

    let closing = Instant::now();
    transport.close();
    assert!(closing.elapsed() < Duration::from_secs(5));
    assert!(matches!(transport.send(1, vec![0]), Err(TransportError::Closed)));
    drop(silent);
    Ok(())
}
