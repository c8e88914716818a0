//! Authenticated point-to-point transport.
//!
//! One [`Transport`] serves both roles:
//!
//! - **Server** (nodes): binds a listener, authenticates every inbound
//!   connection, resolves the remote key through the [`PeerDirectory`] and
//!   dispatches each frame to the registered [`Handlers`].
//! - **Client** (nodes talking to nodes, clients talking to nodes): dials
//!   node peers by id.
//!
//! # Threads
//!
//! - One listener thread per server.
//! - One thread per inbound connection, living as long as the connection.
//! - One writer thread per send destination, fed by a bounded queue. The
//!   writer dials lazily and owns the outbound connection, so `send` never
//!   touches the network on the caller's thread.
//!
//! # Failure handling
//!
//! `send` is fire-and-forget. A node's send only enqueues; when the queue is
//! full the message is dropped. A client's send waits for queue space
//! instead. Writers log network errors, drop the connection and the message,
//! and stop dialing for a short backoff during which queued messages to that
//! peer are discarded. Every dial and write is bounded by a timeout, so a
//! silent peer only ever stalls its own writer.
//!
//! `request` dials on the caller's thread and surfaces network errors,
//! including a response that does not arrive in time. An id missing from the
//! directory is a configuration error reported as
//! [`TransportError::UnknownPeer`].

use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::directory::{PeerClass, PeerDirectory, PublicKey};
use crate::handler::{Handlers, InboundMessage};
use crate::handshake::{HandshakeError, Identity, SecureChannel};
use crate::wire::Frame;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unknown peer {0}")]
    UnknownPeer(u64),
    #[error("could not connect to node {dest}: {source}")]
    Connect {
        dest: u64,
        #[source]
        source: HandshakeError,
    },
    #[error("exchange with node {dest} failed: {source}")]
    Io {
        dest: u64,
        #[source]
        source: io::Error,
    },
    #[error("node {dest} rejected the connection: {reason}")]
    Rejected { dest: u64, reason: String },
    #[error("unexpected frame from node {dest}: {detail}")]
    Protocol { dest: u64, detail: String },
    #[error("transport is closed")]
    Closed,
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const REDIAL_BACKOFF: Duration = Duration::from_millis(500);
const NODE_QUEUE_DEPTH: usize = 4096;
const CLIENT_QUEUE_DEPTH: usize = 64;

/// Settings for a [`Transport`].
pub struct TransportConfig {
    /// Our own id, in the id space of `class`.
    pub id: u64,
    /// Whether we are a node or a client; decides loopback and how inbound
    /// peers see us.
    pub class: PeerClass,
    /// Address to listen on; `None` for clients.
    pub listen: Option<String>,
    pub identity: Identity,
    /// Every peer we may talk to or accept connections from.
    pub directory: Arc<PeerDirectory>,
}

type Connection = Arc<Mutex<SecureChannel>>;

/// Queue and writer thread for one send destination.
struct PeerSender {
    queue: Sender<Vec<u8>>,
    /// Socket of the writer's current connection, so `close` can unblock it.
    socket: Arc<Mutex<Option<TcpStream>>>,
    handle: JoinHandle<()>,
}

struct Shared {
    id: u64,
    class: PeerClass,
    identity: Identity,
    directory: Arc<PeerDirectory>,
    handlers: RwLock<Option<Handlers>>,
    senders: Mutex<HashMap<u64, PeerSender>>,
    /// Request/response connections, one per destination.
    requests: Mutex<HashMap<u64, Connection>>,
    inbound: Mutex<HashMap<u64, TcpStream>>,
    closed: AtomicBool,
    next_request_id: AtomicU64,
    next_connection_id: AtomicU64,
}

impl Shared {
    /// Address and expected key of node `dest`.
    fn target(&self, dest: u64) -> Result<(String, PublicKey), TransportError> {
        let address = self
            .directory
            .address_of(dest)
            .ok_or(TransportError::UnknownPeer(dest))?;
        let key = self
            .directory
            .public_key_of(PeerClass::Node, dest)
            .ok_or(TransportError::UnknownPeer(dest))?;
        Ok((address.to_string(), *key))
    }

    /// Dials and authenticates node `dest` with bounded connect and write
    /// times. `register` sees the raw socket before the handshake starts.
    fn dial(
        &self,
        dest: u64,
        register: impl FnOnce(&TcpStream),
    ) -> Result<SecureChannel, TransportError> {
        let (address, expected) = self.target(dest)?;
        let connect_err = |source: io::Error| TransportError::Connect {
            dest,
            source: HandshakeError::Io(source),
        };
        let addr = address
            .to_socket_addrs()
            .map_err(connect_err)?
            .next()
            .ok_or_else(|| {
                connect_err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{address} did not resolve"),
                ))
            })?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(connect_err)?;
        stream
            .set_write_timeout(Some(WRITE_TIMEOUT))
            .map_err(connect_err)?;
        register(&stream);
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let channel = SecureChannel::initiate(stream, &self.identity, Some(&expected))
            .map_err(|source| TransportError::Connect { dest, source })?;
        debug!(node = self.id, dest, %addr, "connected");
        Ok(channel)
    }
}

/// Authenticated transport endpoint for one node or client.
///
/// Dropping the transport closes it.
pub struct Transport {
    shared: Arc<Shared>,
    listen: Option<String>,
    local_addr: Mutex<Option<SocketAddr>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: config.id,
                class: config.class,
                identity: config.identity,
                directory: config.directory,
                handlers: RwLock::new(None),
                senders: Mutex::new(HashMap::new()),
                requests: Mutex::new(HashMap::new()),
                inbound: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                next_request_id: AtomicU64::new(0),
                next_connection_id: AtomicU64::new(0),
            }),
            listen: config.listen,
            local_addr: Mutex::new(None),
            listener: Mutex::new(None),
        }
    }

    /// Registers the inbound handlers. Must happen before [`start`](Self::start)
    /// for a server, otherwise early frames close their connections.
    pub fn handle(&self, handlers: Handlers) {
        *self.shared.handlers.write().expect("handlers poisoned") = Some(handlers);
    }

    /// Binds the listener (server role only) and starts accepting.
    pub fn start(&self) -> Result<()> {
        let Some(listen) = self.listen.as_deref() else {
            return Ok(());
        };
        let listener =
            TcpListener::bind(listen).with_context(|| format!("failed to bind {listen}"))?;
        let addr = listener.local_addr().context("failed to read listener address")?;
        *self.local_addr.lock().expect("transport poisoned") = Some(addr);
        info!(node = self.shared.id, %addr, "transport listening");

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("net-listener-{}", self.shared.id))
            .spawn(move || accept_loop(listener, shared))
            .context("failed to spawn network listener")?;
        *self.listener.lock().expect("transport poisoned") = Some(handle);
        Ok(())
    }

    /// Bound listener address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("transport poisoned")
    }

    /// Fire-and-forget send to a node.
    ///
    /// Hands the message to the destination's writer and returns; delivery
    /// happens in the background. Only an unknown destination or a closed
    /// transport is an error. Sends to self are looped back to the local node
    /// handler without touching the network.
    pub fn send(&self, dest: u64, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.shared.class == PeerClass::Node && dest == self.shared.id {
            self.loopback(payload);
            return Ok(());
        }

        let frame = encode_frame(&Frame::Send(payload), dest)?;
        let queue = self.queue(dest)?;
        match self.shared.class {
            PeerClass::Node => match queue.try_send(frame) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    warn!(node = self.shared.id, dest, "send queue full, dropping message");
                    Ok(())
                }
                Err(TrySendError::Disconnected(_)) => Err(TransportError::Closed),
            },
            PeerClass::Client => queue.send(frame).map_err(|_| TransportError::Closed),
        }
    }

    /// Sends `payload` as a request and blocks for the matching response,
    /// for at most thirty seconds.
    pub fn request(&self, dest: u64, payload: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let id = self.shared.next_request_id.fetch_add(1, Ordering::SeqCst);
        let frame = encode_frame(&Frame::Request { id, payload }, dest)?;
        let connection = self.connection(dest)?;

        let result = exchange(&connection, dest, id, &frame);
        if result.is_err() {
            self.forget(dest, &connection);
        }
        result
    }

    /// Stops accepting, closes every connection and joins the listener and
    /// every writer.
    ///
    /// Messages still queued for a writer or in socket buffers may be lost.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(addr) = self.local_addr() {
            // Wake the blocking accept so the listener observes `closed`.
            let _ = TcpStream::connect(addr);
        }
        if let Some(handle) = self.listener.lock().expect("transport poisoned").take() {
            if handle.join().is_err() {
                warn!(node = self.shared.id, "listener thread panicked");
            }
        }

        for (_, stream) in self.shared.inbound.lock().expect("transport poisoned").drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }

        let senders: Vec<(u64, PeerSender)> = self
            .shared
            .senders
            .lock()
            .expect("transport poisoned")
            .drain()
            .collect();
        for (dest, sender) in senders {
            drop(sender.queue);
            if let Some(stream) = sender.socket.lock().expect("writer socket poisoned").take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
            if sender.handle.join().is_err() {
                warn!(node = self.shared.id, dest, "writer thread panicked");
            }
        }

        let requests: Vec<Connection> = self
            .shared
            .requests
            .lock()
            .expect("transport poisoned")
            .drain()
            .map(|(_, connection)| connection)
            .collect();
        for connection in requests {
            if let Ok(stream) = connection.lock().expect("connection poisoned").try_clone_stream() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
        debug!(node = self.shared.id, "transport closed");
    }

    fn loopback(&self, payload: Vec<u8>) {
        let handlers = self.shared.handlers.read().expect("handlers poisoned").clone();
        let Some(handlers) = handlers else {
            warn!(node = self.shared.id, "no handlers registered, dropping loopback message");
            return;
        };
        let msg = InboundMessage {
            sender: self.shared.id,
            class: PeerClass::Node,
            payload,
            is_request: false,
        };
        if let Err(err) = handlers.dispatch(msg) {
            warn!(node = self.shared.id, error = %err, "loopback handler failed");
        }
    }

    /// Queue of the writer for `dest`, spawning the writer on first use.
    fn queue(&self, dest: u64) -> Result<Sender<Vec<u8>>, TransportError> {
        self.shared.target(dest)?;
        let mut senders = self.shared.senders.lock().expect("transport poisoned");
        // Checked under the lock so no writer outlives `close`.
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if let Some(sender) = senders.get(&dest) {
            return Ok(sender.queue.clone());
        }

        let depth = match self.shared.class {
            PeerClass::Node => NODE_QUEUE_DEPTH,
            PeerClass::Client => CLIENT_QUEUE_DEPTH,
        };
        let (queue, frames) = bounded(depth);
        let socket = Arc::new(Mutex::new(None));
        let shared = Arc::clone(&self.shared);
        let writer_socket = Arc::clone(&socket);
        let handle = thread::Builder::new()
            .name(format!("net-writer-{}-{dest}", self.shared.id))
            .spawn(move || write_loop(&shared, dest, frames, &writer_socket))
            .map_err(|source| TransportError::Io { dest, source })?;
        senders.insert(
            dest,
            PeerSender {
                queue: queue.clone(),
                socket,
                handle,
            },
        );
        Ok(queue)
    }

    /// Returns the cached request connection to `dest`, dialing if needed.
    fn connection(&self, dest: u64) -> Result<Connection, TransportError> {
        self.shared.target(dest)?;
        if let Some(connection) = self.shared.requests.lock().expect("transport poisoned").get(&dest) {
            return Ok(Arc::clone(connection));
        }

        let channel = self.shared.dial(dest, |_| {})?;
        channel
            .set_read_timeout(Some(REQUEST_TIMEOUT))
            .map_err(|source| TransportError::Io { dest, source })?;
        let connection = Arc::new(Mutex::new(channel));
        let mut requests = self.shared.requests.lock().expect("transport poisoned");
        Ok(Arc::clone(requests.entry(dest).or_insert(connection)))
    }

    /// Drops `connection` from the cache if it is still the cached one.
    fn forget(&self, dest: u64, connection: &Connection) {
        let mut requests = self.shared.requests.lock().expect("transport poisoned");
        if requests
            .get(&dest)
            .is_some_and(|cached| Arc::ptr_eq(cached, connection))
        {
            requests.remove(&dest);
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

fn encode_frame(frame: &Frame, dest: u64) -> Result<Vec<u8>, TransportError> {
    frame.encode().map_err(|err| TransportError::Protocol {
        dest,
        detail: err.to_string(),
    })
}

fn exchange(
    connection: &Connection,
    dest: u64,
    id: u64,
    frame: &[u8],
) -> Result<Vec<u8>, TransportError> {
    let io_err = |source| TransportError::Io { dest, source };
    let mut channel = connection.lock().expect("connection poisoned");
    channel.send_frame(frame).map_err(io_err)?;
    loop {
        let Some(bytes) = channel.recv_frame().map_err(io_err)? else {
            return Err(io_err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before response",
            )));
        };
        match Frame::decode(&bytes) {
            Ok(Frame::Response { id: got, payload }) if got == id => return Ok(payload),
            Ok(Frame::Response { id: got, .. }) => {
                debug!(dest, expected = id, got, "discarding stale response");
            }
            Ok(Frame::Rejected { reason }) => return Err(TransportError::Rejected { dest, reason }),
            Ok(other) => {
                return Err(TransportError::Protocol {
                    dest,
                    detail: format!("{other:?}"),
                });
            }
            Err(err) => {
                return Err(TransportError::Protocol {
                    dest,
                    detail: err.to_string(),
                });
            }
        }
    }
}

/// Writer for one destination: drains its queue onto a lazily dialed
/// connection until the transport closes.
fn write_loop(
    shared: &Shared,
    dest: u64,
    frames: Receiver<Vec<u8>>,
    socket: &Mutex<Option<TcpStream>>,
) {
    let mut channel: Option<SecureChannel> = None;
    let mut retry_at: Option<Instant> = None;

    for frame in frames.iter() {
        if shared.closed.load(Ordering::SeqCst) {
            break;
        }
        if channel.is_none() {
            if retry_at.is_some_and(|at| Instant::now() < at) {
                debug!(node = shared.id, dest, "peer unreachable, dropping message");
                continue;
            }
            let dialed = shared.dial(dest, |stream| {
                *socket.lock().expect("writer socket poisoned") = stream.try_clone().ok();
            });
            match dialed {
                Ok(dialed) => {
                    retry_at = None;
                    channel = Some(dialed);
                }
                Err(err) => {
                    if !shared.closed.load(Ordering::SeqCst) {
                        warn!(node = shared.id, dest, error = %err, "dropping message");
                    }
                    *socket.lock().expect("writer socket poisoned") = None;
                    retry_at = Some(Instant::now() + REDIAL_BACKOFF);
                    continue;
                }
            }
        }

        let Some(open) = channel.as_mut() else {
            continue;
        };
        if let Err(err) = open.send_frame(&frame) {
            if !shared.closed.load(Ordering::SeqCst) {
                warn!(node = shared.id, dest, error = %err, "send failed, dropping message");
            }
            channel = None;
            *socket.lock().expect("writer socket poisoned") = None;
        }
    }
    debug!(node = shared.id, dest, "writer stopped");
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    for stream in listener.incoming() {
        if shared.closed.load(Ordering::SeqCst) {
            break;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                warn!(node = shared.id, error = %err, "accept failed");
                continue;
            }
        };
        let connection_id = shared.next_connection_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(clone) = stream.try_clone() {
            shared
                .inbound
                .lock()
                .expect("transport poisoned")
                .insert(connection_id, clone);
        }
        let shared = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name(format!("net-conn-{}", shared.id))
            .spawn(move || {
                let peer = stream.peer_addr().ok();
                let result = serve_connection(stream, &shared);
                // Dropping the registered clone releases the socket.
                shared
                    .inbound
                    .lock()
                    .expect("transport poisoned")
                    .remove(&connection_id);
                if let Err(err) = result {
                    if !shared.closed.load(Ordering::SeqCst) {
                        warn!(node = shared.id, ?peer, error = ?err, "connection closed with error");
                    }
                }
            });
        if let Err(err) = spawned {
            warn!(error = %err, "failed to spawn connection thread");
        }
    }
}

fn serve_connection(stream: TcpStream, shared: &Shared) -> Result<()> {
    let mut channel =
        SecureChannel::accept(stream, &shared.identity).context("inbound handshake failed")?;

    let Some((sender, class)) = shared.directory.resolve(channel.remote_key()) else {
        let reason = "unknown sender".to_string();
        channel.send_frame(&Frame::Rejected { reason }.encode()?)?;
        bail!(
            "rejected unknown public key {}",
            hex::encode(channel.remote_key())
        );
    };
    debug!(node = shared.id, sender, %class, "accepted connection");

    while let Some(bytes) = channel.recv_frame()? {
        let frame = Frame::decode(&bytes)?;
        let handlers = shared
            .handlers
            .read()
            .expect("handlers poisoned")
            .clone()
            .ok_or_else(|| anyhow!("no handlers registered"))?;
        match frame {
            Frame::Send(payload) => {
                handlers.dispatch(InboundMessage {
                    sender,
                    class,
                    payload,
                    is_request: false,
                })?;
            }
            Frame::Request { id, payload } => {
                let response = handlers.dispatch(InboundMessage {
                    sender,
                    class,
                    payload,
                    is_request: true,
                })?;
                channel.send_frame(&Frame::Response { id, payload: response }.encode()?)?;
            }
            other => bail!("unexpected frame from {class} {sender}: {other:?}"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::PeerRecord;
    use crate::handler::MessageHandler;
    use crossbeam_channel::{Sender, unbounded};
    use std::time::Duration;

    struct Recorder {
        tx: Sender<InboundMessage>,
    }

    impl MessageHandler for Recorder {
        fn handle(&self, msg: InboundMessage) -> Result<Vec<u8>> {
            let reply = msg.payload.iter().rev().copied().collect();
            self.tx.send(msg)?;
            Ok(reply)
        }
    }

    #[test]
    fn test_unknown_destination_is_error() {
        let identity = Identity::generate();
        let directory = PeerDirectory::new(
            vec![PeerRecord::node(0, "127.0.0.1:1", identity.public_key())],
            vec![],
        )
        .unwrap();
        let transport = Transport::new(TransportConfig {
            id: 0,
            class: PeerClass::Node,
            listen: None,
            identity,
            directory: Arc::new(directory),
        });
        assert!(matches!(
            transport.send(9, vec![1]),
            Err(TransportError::UnknownPeer(9))
        ));
    }

    #[test]
    fn test_loopback_skips_network() -> Result<()> {
        let identity = Identity::generate();
        let directory = PeerDirectory::new(
            vec![PeerRecord::node(0, "127.0.0.1:1", identity.public_key())],
            vec![],
        )?;
        let transport = Transport::new(TransportConfig {
            id: 0,
            class: PeerClass::Node,
            listen: None,
            identity,
            directory: Arc::new(directory),
        });
        let (tx, rx) = unbounded();
        let recorder: Arc<dyn MessageHandler> = Arc::new(Recorder { tx });
        transport.handle(Handlers::new(recorder, None));

        transport.send(0, vec![1, 2])?;
        let msg = rx.recv_timeout(Duration::from_secs(1))?;
        assert_eq!(msg.sender, 0);
        assert_eq!(msg.payload, vec![1, 2]);
        Ok(())
    }
}
