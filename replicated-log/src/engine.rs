//! Boundary between the replica driver and a consensus engine.
//!
//! The driver never looks inside the engine. It feeds the engine ticks,
//! protocol messages and client proposals, pulls [`ActionBatch`]es out of it,
//! hands each batch to a processor and returns the outcome as a
//! [`ResultBatch`]. At most one batch is in flight at any time.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::storage::RequestStore;
pub use crate::wire::ClientRequest;

pub type NodeId = u64;
pub type ClientId = u64;
pub type RequestDigest = [u8; 32];

/// Checkpoint value a freshly bootstrapped network starts from.
pub const INITIAL_CHECKPOINT_VALUE: &[u8] = b"initial-checkpoint-value";

/// SHA-256 of a request payload.
pub fn digest(data: &[u8]) -> RequestDigest {
    Sha256::digest(data).into()
}

/// A request payload either carried in place or referenced by digest in the
/// request store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataRef {
    Inline(Vec<u8>),
    Stored(RequestDigest),
}

/// Unique key of a stored request payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    pub client_id: ClientId,
    pub req_no: u64,
    pub digest: RequestDigest,
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "client={} req_no={} digest={}",
            self.client_id,
            self.req_no,
            hex::encode(&self.digest[..8])
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRef {
    pub client_id: ClientId,
    pub req_no: u64,
    pub data: DataRef,
}

impl RequestRef {
    pub fn key(&self) -> RequestKey {
        let digest = match &self.data {
            DataRef::Inline(data) => digest(data),
            DataRef::Stored(digest) => *digest,
        };
        RequestKey {
            client_id: self.client_id,
            req_no: self.req_no,
            digest,
        }
    }
}

/// One ordered unit of committed work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedEntry {
    pub seq_no: u64,
    pub requests: Vec<RequestRef>,
}

/// Static shape of the network, fixed at bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub nodes: Vec<NodeId>,
    pub number_of_buckets: u32,
    pub checkpoint_interval: u32,
}

/// Per-client deduplication window, in the form carried by checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientState {
    pub id: ClientId,
    /// How far above the low watermark request numbers may run ahead.
    pub width: u32,
    /// Every request number below this one has committed.
    pub low_watermark: u64,
    /// Committed request numbers above the low watermark.
    pub committed_above: Vec<u64>,
}

impl ClientState {
    pub fn new(id: ClientId, width: u32) -> Self {
        Self {
            id,
            width,
            low_watermark: 0,
            committed_above: Vec::new(),
        }
    }
}

/// Replicated state embedded in every checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    pub config: NetworkConfig,
    pub clients: Vec<ClientState>,
}

/// Durable log records, written by the processor in batch order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalRecord {
    Bootstrap {
        state: NetworkState,
        checkpoint_value: Vec<u8>,
    },
    HardState {
        term: u64,
        vote: u64,
        commit: u64,
    },
    Entry {
        index: u64,
        term: u64,
        normal: bool,
        data: Vec<u8>,
    },
    Checkpoint {
        seq: u64,
        value: Vec<u8>,
    },
}

/// Hard state as recovered from the WAL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HardStateRecord {
    pub term: u64,
    pub vote: u64,
    pub commit: u64,
}

/// Log entry as recovered from the WAL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRecord {
    pub index: u64,
    pub term: u64,
    pub normal: bool,
    pub data: Vec<u8>,
}

/// Everything an engine needs to resume after a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredLog {
    pub initial_state: NetworkState,
    pub initial_checkpoint: Vec<u8>,
    pub hard_state: HardStateRecord,
    pub entries: Vec<EntryRecord>,
    pub last_checkpoint: Option<Checkpoint>,
}

/// Application checkpoint value covering everything up to `seq`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub seq: u64,
    pub value: Vec<u8>,
}

/// Something the processor must make durable before sending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Persist {
    /// A request payload for the request store.
    Request { key: RequestKey, data: Vec<u8> },
    /// A record appended to the WAL.
    Log(WalRecord),
}

/// Engine message for another node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outbound {
    pub to: NodeId,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Commit {
    Entry(CommittedEntry),
    /// Ask the application for a checkpoint value covering `seq`.
    Checkpoint { seq: u64, state: NetworkState },
}

/// A peer checkpoint this node should adopt in place of its own state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransfer {
    pub seq: u64,
    pub value: Vec<u8>,
}

/// Work emitted by the engine, processed in field order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionBatch {
    pub persist: Vec<Persist>,
    pub send: Vec<Outbound>,
    pub state_transfer: Option<StateTransfer>,
    pub commits: Vec<Commit>,
}

impl ActionBatch {
    pub fn is_empty(&self) -> bool {
        self.persist.is_empty()
            && self.send.is_empty()
            && self.state_transfer.is_none()
            && self.commits.is_empty()
    }
}

/// Network state recovered from a transferred checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transferred {
    pub seq: u64,
    pub state: NetworkState,
}

/// Outcome of processing one [`ActionBatch`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultBatch {
    pub checkpoints: Vec<Checkpoint>,
    pub transferred: Option<Transferred>,
    pub applied_through: Option<u64>,
}

/// Point-in-time view of the engine, logged when it fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub node_id: NodeId,
    pub role: String,
    pub leader: Option<NodeId>,
    pub term: u64,
    pub committed: u64,
    pub applied: u64,
    pub last_checkpoint: Option<u64>,
    pub pending_requests: usize,
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "node {} ({})", self.node_id, self.role)?;
        match self.leader {
            Some(leader) => writeln!(f, "  leader:          {leader}")?,
            None => writeln!(f, "  leader:          none")?,
        }
        writeln!(f, "  term:            {}", self.term)?;
        writeln!(f, "  committed:       {}", self.committed)?;
        writeln!(f, "  applied:         {}", self.applied)?;
        match self.last_checkpoint {
            Some(seq) => writeln!(f, "  last checkpoint: {seq}")?,
            None => writeln!(f, "  last checkpoint: none")?,
        }
        write!(f, "  pending:         {}", self.pending_requests)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// The input was refused; the engine itself is still healthy.
    #[error("input rejected: {0}")]
    Rejected(String),
    #[error("engine stopped")]
    Stopped,
    #[error("an action batch is already in flight")]
    BatchInFlight,
    #[error("results submitted with no action batch in flight")]
    NoBatchInFlight,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Control interface of a consensus engine.
pub trait ConsensusEngine {
    /// Advances the engine's logical clock by one tick.
    fn tick(&mut self) -> Result<(), EngineError>;

    /// Feeds a protocol message received from another node.
    fn step(&mut self, from: NodeId, msg: &[u8]) -> Result<(), EngineError>;

    /// Submits a client request for ordering.
    fn propose(&mut self, request: ClientRequest) -> Result<(), EngineError>;

    /// Takes the next batch of work, if any. Fails with
    /// [`EngineError::BatchInFlight`] until the previous batch's results have
    /// been added.
    fn ready(&mut self) -> Result<Option<ActionBatch>, EngineError>;

    /// Completes the batch in flight with what processing it produced.
    fn add_results(&mut self, results: ResultBatch) -> Result<(), EngineError>;

    /// Snapshot for diagnostics; cheap and side-effect free.
    fn status(&self) -> EngineStatus;
}

/// Creates an engine either for a brand new network or from a recovered log.
pub trait EngineBuilder {
    type Engine: ConsensusEngine;

    fn bootstrap(
        &self,
        initial: NetworkState,
        checkpoint_value: Vec<u8>,
    ) -> anyhow::Result<Self::Engine>;

    /// Rebuilds an engine from its WAL. `store` holds the payloads the WAL
    /// only references by digest.
    fn restart(
        &self,
        recovered: RecoveredLog,
        store: &dyn RequestStore,
    ) -> anyhow::Result<Self::Engine>;

    /// Watermark table the engine publishes into.
    fn watermarks(&self) -> Arc<WatermarkTable>;
}

/// Input for the driver thread, produced by the transport's handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ingress {
    Step { from: NodeId, msg: Vec<u8> },
    Propose(ClientRequest),
}

/// Cloneable sending side of the engine's input channel.
#[derive(Debug, Clone)]
pub struct EngineIngress {
    tx: Sender<Ingress>,
}

impl EngineIngress {
    pub fn channel() -> (Self, Receiver<Ingress>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    pub fn step(&self, from: NodeId, msg: Vec<u8>) -> anyhow::Result<()> {
        self.tx
            .send(Ingress::Step { from, msg })
            .map_err(|_| anyhow::anyhow!("replica driver has stopped"))
    }

    pub fn propose(&self, request: ClientRequest) -> anyhow::Result<()> {
        self.tx
            .send(Ingress::Propose(request))
            .map_err(|_| anyhow::anyhow!("replica driver has stopped"))
    }
}

/// Next expected request number per client, as of the last commit.
///
/// Written by the engine on the driver thread and read by client handlers
/// answering watermark queries.
#[derive(Debug, Default)]
pub struct WatermarkTable {
    inner: RwLock<HashMap<ClientId, u64>>,
}

impl WatermarkTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, client_id: ClientId, low_watermark: u64) {
        self.inner
            .write()
            .expect("watermark table poisoned")
            .insert(client_id, low_watermark);
    }

    /// Returns 0 for clients that have never committed anything.
    pub fn next_req_no(&self, client_id: ClientId) -> u64 {
        self.inner
            .read()
            .expect("watermark table poisoned")
            .get(&client_id)
            .copied()
            .unwrap_or(0)
    }
}

/// Sliding window of committed request numbers for one client.
///
/// Commit decisions depend only on the committed log, so every replica filters
/// duplicates identically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientWindow {
    width: u64,
    low: u64,
    committed: BTreeSet<u64>,
}

impl ClientWindow {
    pub fn new(width: u32) -> Self {
        Self {
            width: u64::from(width.max(1)),
            low: 0,
            committed: BTreeSet::new(),
        }
    }

    pub fn from_state(state: &ClientState) -> Self {
        Self {
            width: u64::from(state.width.max(1)),
            low: state.low_watermark,
            committed: state.committed_above.iter().copied().collect(),
        }
    }

    pub fn to_state(&self, id: ClientId) -> ClientState {
        ClientState {
            id,
            width: self.width as u32,
            low_watermark: self.low,
            committed_above: self.committed.iter().copied().collect(),
        }
    }

    pub fn low_watermark(&self) -> u64 {
        self.low
    }

    /// Whether `req_no` may be proposed now.
    pub fn in_window(&self, req_no: u64) -> bool {
        req_no >= self.low && req_no < self.low + self.width && !self.committed.contains(&req_no)
    }

    /// Whether `req_no` has already been committed.
    pub fn is_committed(&self, req_no: u64) -> bool {
        req_no < self.low || self.committed.contains(&req_no)
    }

    /// Records a commit. Returns `false` for duplicates and out-of-window
    /// numbers, which must not be applied.
    pub fn commit(&mut self, req_no: u64) -> bool {
        if !self.in_window(req_no) {
            return false;
        }
        self.committed.insert(req_no);
        while self.committed.remove(&self.low) {
            self.low += 1;
        }
        true
    }
}
