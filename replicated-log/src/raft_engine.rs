//! [`ConsensusEngine`] backed by tikv/raft.
//!
//! This adapter turns raft's Ready/advance protocol into the
//! [`ActionBatch`]/[`ResultBatch`] exchange the replica driver expects:
//!
//! - **Ready**: hard state, new entries and outbound messages become one
//!   batch, together with the entries raft reports as committed.
//! - **LightReady**: whatever `advance` returns (commit index moves,
//!   follow-up messages and commits) is carried into the next batch instead
//!   of being applied inline.
//!
//! # Client requests
//!
//! Clients broadcast every request to every node. Each node buffers the
//! requests it receives and only the leader proposes them, batched into raft
//! entries. Leadership changes can therefore order the same request twice; a
//! per-client window evaluated at commit time drops the duplicates. Because
//! the window only depends on the committed log, every node drops the same
//! ones.
//!
//! # Storage
//!
//! Raft's own log lives in `MemStorage`. The durable copy is the WAL written
//! by the processor: entries are persisted with request payloads replaced by
//! their digests, and payloads go to the request store. On restart the log
//! is rebuilt from the WAL with nothing applied, so every committed entry is
//! replayed.
//!
//! Entries in `MemStorage` always carry payloads inline. Restart reads each
//! digest back from the request store before the entry re-enters raft's log,
//! because a restarted leader replicates those entries to followers that may
//! never have seen the request.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use prost::Message as ProstMessage;
use raft::prelude::{ConfState, Config, Entry, EntryType, HardState, Message};
use raft::storage::MemStorage;
use raft::{RawNode, Ready, StateRole};
use serde::{Deserialize, Serialize};
use slog::{Logger, o};
use tracing::{debug, info};

use crate::engine::{
    ActionBatch, ClientId, ClientWindow, Commit, CommittedEntry, ConsensusEngine, DataRef,
    EngineBuilder, EngineError, EngineStatus, EntryRecord, NetworkConfig, NetworkState, NodeId,
    Outbound, Persist, RecoveredLog, RequestKey, RequestRef, ResultBatch, StateTransfer,
    WalRecord, WatermarkTable, digest,
};
use crate::storage::RequestStore;
use crate::wire::ClientRequest;

/// Raft reserves id 0, so node `n` is raft peer `n + 1`.
fn raft_id(node: NodeId) -> u64 {
    node + 1
}

fn node_id(raft_id: u64) -> NodeId {
    raft_id - 1
}

/// Creates a logger that discards all output; raft's internals are not
/// interesting at our log levels.
fn silent_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// Timing and batching knobs for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// This node's id in the network; raft sees it as `node_id + 1`.
    pub node_id: NodeId,
    /// Ticks between leader heartbeats.
    pub heartbeat_ticks: u32,
    /// Ticks without a heartbeat before a follower suspects the leader.
    pub suspect_ticks: u32,
    /// Extra ticks of randomized election backoff.
    pub epoch_change_timeout_ticks: u32,
    /// Maximum client requests per raft entry.
    pub batch_size: u32,
}

impl EngineConfig {
    fn raft_config(&self) -> Config {
        let heartbeat_tick = self.heartbeat_ticks.max(1) as usize;
        let election_tick = (self.suspect_ticks as usize).max(heartbeat_tick + 1);
        Config {
            id: raft_id(self.node_id),
            election_tick,
            heartbeat_tick,
            max_election_tick: election_tick + self.epoch_change_timeout_ticks.max(1) as usize,
            max_inflight_msgs: 256,
            max_size_per_msg: 1024 * 1024,
            pre_vote: true,
            ..Default::default()
        }
    }
}

/// Payload of a normal raft entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ProposalBatch {
    requests: Vec<RequestRef>,
}

impl ProposalBatch {
    fn encode(&self) -> anyhow::Result<Vec<u8>> {
        bincode::serialize(self).context("failed to encode proposal batch")
    }

    fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        bincode::deserialize(bytes).context("failed to decode proposal batch")
    }
}

/// The batch currently owned by the processor.
enum InFlight {
    /// A full raft Ready; results complete it with `advance`.
    Ready(Ready),
    /// Work carried over from a LightReady; results complete it with
    /// `advance_apply`.
    Light,
    /// Only locally queued persistence, nothing raft is waiting on.
    Detached,
}

/// LightReady output waiting for the next `ready()` call.
struct Carried {
    commit: Option<u64>,
    committed: Vec<Entry>,
    messages: Vec<Message>,
}

/// A raft replica driven through the [`ConsensusEngine`] interface.
///
/// Owns raft's in-memory log and the per-client windows. Everything it needs
/// persisted or sent comes out of [`ConsensusEngine::ready`].
pub struct RaftEngine {
    node_id: NodeId,
    raw: RawNode<MemStorage>,
    storage: MemStorage,
    batch_size: usize,
    network: NetworkConfig,
    clients: BTreeMap<ClientId, ClientWindow>,
    watermarks: Arc<WatermarkTable>,
    /// Requests received but not yet committed, in proposal order.
    pending: BTreeMap<(ClientId, u64), Vec<u8>>,
    /// Pending requests proposed during the current term.
    proposed: HashSet<(ClientId, u64)>,
    queued: Vec<Persist>,
    in_flight: Option<InFlight>,
    carried: Option<Carried>,
    last_role: (StateRole, u64),
    last_checkpoint: Option<u64>,
    applied: u64,
}

impl RaftEngine {
    /// Creates an engine for a brand new network. The bootstrap record is
    /// the first thing the engine asks to persist.
    pub fn bootstrap(
        config: &EngineConfig,
        initial: NetworkState,
        checkpoint_value: Vec<u8>,
        watermarks: Arc<WatermarkTable>,
    ) -> anyhow::Result<Self> {
        let storage = MemStorage::new_with_conf_state(conf_state(&initial.config));
        let queued = vec![Persist::Log(WalRecord::Bootstrap {
            state: initial.clone(),
            checkpoint_value,
        })];
        Self::new(config, storage, initial, watermarks, queued)
    }

    /// Rebuilds an engine from its WAL. Nothing counts as applied, so every
    /// committed entry is delivered again.
    ///
    /// Fails if `store` is missing a payload the WAL references.
    pub fn restart(
        config: &EngineConfig,
        recovered: RecoveredLog,
        store: &dyn RequestStore,
        watermarks: Arc<WatermarkTable>,
    ) -> anyhow::Result<Self> {
        let storage = MemStorage::new_with_conf_state(conf_state(&recovered.initial_state.config));
        {
            let mut core = storage.wl();
            let entries = recovered
                .entries
                .iter()
                .map(|record| restored_entry(record, store))
                .collect::<anyhow::Result<Vec<Entry>>>()?;
            if !entries.is_empty() {
                core.append(&entries).context("failed to restore log entries")?;
            }
            let last_index = entries.last().map(|entry| entry.index).unwrap_or(0);
            let mut hard_state = HardState::default();
            hard_state.term = recovered.hard_state.term;
            hard_state.vote = recovered.hard_state.vote;
            hard_state.commit = recovered.hard_state.commit.min(last_index);
            core.set_hardstate(hard_state);
        }
        info!(
            node = config.node_id,
            entries = recovered.entries.len(),
            commit = recovered.hard_state.commit,
            "restarting from WAL"
        );
        let mut engine = Self::new(
            config,
            storage,
            recovered.initial_state,
            watermarks,
            Vec::new(),
        )?;
        engine.last_checkpoint = recovered.last_checkpoint.map(|checkpoint| checkpoint.seq);
        Ok(engine)
    }

    fn new(
        config: &EngineConfig,
        storage: MemStorage,
        initial: NetworkState,
        watermarks: Arc<WatermarkTable>,
        queued: Vec<Persist>,
    ) -> anyhow::Result<Self> {
        let raw = RawNode::new(&config.raft_config(), storage.clone(), &silent_logger())
            .with_context(|| format!("failed to construct raft node {}", config.node_id))?;
        let last_role = (raw.raft.state, raw.raft.term);
        let engine = Self {
            node_id: config.node_id,
            raw,
            storage,
            batch_size: config.batch_size.max(1) as usize,
            network: initial.config,
            clients: initial
                .clients
                .iter()
                .map(|client| (client.id, ClientWindow::from_state(client)))
                .collect(),
            watermarks,
            pending: BTreeMap::new(),
            proposed: HashSet::new(),
            queued,
            in_flight: None,
            carried: None,
            last_role,
            last_checkpoint: None,
            applied: 0,
        };
        engine.publish_watermarks();
        Ok(engine)
    }

    /// Current replicated state, as embedded in checkpoints.
    pub fn network_state(&self) -> NetworkState {
        NetworkState {
            config: self.network.clone(),
            clients: self
                .clients
                .iter()
                .map(|(&id, window)| window.to_state(id))
                .collect(),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.raw.raft.state == StateRole::Leader
    }

    fn publish_watermarks(&self) {
        for (&id, window) in &self.clients {
            self.watermarks.publish(id, window.low_watermark());
        }
    }

    /// Logs role or term changes and forgets what was proposed under the old
    /// role, so a new leader re-proposes everything still pending.
    fn observe_role(&mut self) {
        let current = (self.raw.raft.state, self.raw.raft.term);
        if current != self.last_role {
            info!(
                node = self.node_id,
                from = ?self.last_role.0,
                to = ?current.0,
                term = current.1,
                leader = ?self.leader(),
                "role changed"
            );
            self.proposed.clear();
            self.last_role = current;
        }
    }

    fn leader(&self) -> Option<NodeId> {
        let leader = self.raw.raft.leader_id;
        (leader != raft::INVALID_ID).then(|| node_id(leader))
    }

    /// Proposes every pending, unproposed, in-window request, `batch_size`
    /// at a time. No-op unless leader.
    fn propose_pending(&mut self) -> Result<(), EngineError> {
        if !self.is_leader() {
            return Ok(());
        }
        loop {
            let requests: Vec<RequestRef> = self
                .pending
                .iter()
                .filter(|(key, _)| !self.proposed.contains(*key))
                .filter(|((client_id, req_no), _)| {
                    self.clients
                        .get(client_id)
                        .is_some_and(|window| window.in_window(*req_no))
                })
                .take(self.batch_size)
                .map(|(&(client_id, req_no), data)| RequestRef {
                    client_id,
                    req_no,
                    data: DataRef::Inline(data.clone()),
                })
                .collect();
            if requests.is_empty() {
                return Ok(());
            }

            let keys: Vec<(ClientId, u64)> = requests
                .iter()
                .map(|request| (request.client_id, request.req_no))
                .collect();
            let data = ProposalBatch { requests }.encode()?;
            match self.raw.propose(vec![], data) {
                Ok(()) => {
                    debug!(node = self.node_id, requests = keys.len(), "proposed batch");
                    self.proposed.extend(keys);
                }
                Err(raft::Error::ProposalDropped) => {
                    debug!(node = self.node_id, "proposal dropped");
                    return Ok(());
                }
                Err(err) => {
                    return Err(EngineError::Internal(
                        anyhow!(err).context("failed to propose batch"),
                    ));
                }
            }
        }
    }

    fn outbound(&self, messages: Vec<Message>) -> Vec<Outbound> {
        messages
            .into_iter()
            .map(|msg| Outbound {
                to: node_id(msg.to),
                payload: msg.encode_to_vec(),
            })
            .collect()
    }

    /// Filters committed entries through the client windows and schedules
    /// checkpoints at every multiple of the checkpoint interval.
    fn commit_entries(&mut self, entries: Vec<Entry>) -> anyhow::Result<Vec<Commit>> {
        let mut commits = Vec::new();
        for entry in entries {
            if entry.entry_type() == EntryType::EntryNormal && !entry.data.is_empty() {
                let proposal = ProposalBatch::decode(&entry.data)
                    .with_context(|| format!("corrupt entry at index {}", entry.index))?;
                let mut requests = Vec::with_capacity(proposal.requests.len());
                for request in proposal.requests {
                    let key = (request.client_id, request.req_no);
                    self.pending.remove(&key);
                    self.proposed.remove(&key);
                    let fresh = self
                        .clients
                        .get_mut(&request.client_id)
                        .is_some_and(|window| window.commit(request.req_no));
                    if fresh {
                        requests.push(request);
                    } else {
                        debug!(
                            node = self.node_id,
                            client = key.0,
                            req_no = key.1,
                            index = entry.index,
                            "dropping duplicate commit"
                        );
                    }
                }
                if !requests.is_empty() {
                    commits.push(Commit::Entry(CommittedEntry {
                        seq_no: entry.index,
                        requests,
                    }));
                }
            }

            let interval = u64::from(self.network.checkpoint_interval);
            if interval > 0 && entry.index % interval == 0 {
                commits.push(Commit::Checkpoint {
                    seq: entry.index,
                    state: self.network_state(),
                });
            }
        }
        self.publish_watermarks();
        Ok(commits)
    }

    /// Adopts a transferred network state wholesale.
    fn adopt(&mut self, state: NetworkState) {
        self.network = state.config;
        self.clients = state
            .clients
            .iter()
            .map(|client| (client.id, ClientWindow::from_state(client)))
            .collect();
        let clients = &self.clients;
        self.pending.retain(|(client_id, req_no), _| {
            clients
                .get(client_id)
                .is_some_and(|window| !window.is_committed(*req_no))
        });
        self.proposed.clear();
        self.publish_watermarks();
    }

    /// Completes a full Ready once its batch has been processed.
    fn advance(&mut self, ready: Ready) -> anyhow::Result<()> {
        if !ready.snapshot().is_empty() {
            self.storage
                .wl()
                .apply_snapshot(ready.snapshot().clone())
                .context("apply snapshot failed")?;
        }
        if !ready.entries().is_empty() {
            self.storage
                .wl()
                .append(ready.entries())
                .context("append entries failed")?;
        }
        if let Some(hard_state) = ready.hs() {
            self.storage.wl().set_hardstate(hard_state.clone());
        }

        let mut light_ready = self.raw.advance(ready);
        let commit = light_ready.commit_index();
        if let Some(commit) = commit {
            self.storage.wl().mut_hard_state().set_commit(commit);
        }
        let committed = light_ready.take_committed_entries();
        let messages = light_ready.take_messages();

        if commit.is_none() && committed.is_empty() && messages.is_empty() {
            self.raw.advance_apply();
        } else {
            self.carried = Some(Carried {
                commit,
                committed,
                messages,
            });
        }
        Ok(())
    }
}

fn conf_state(config: &NetworkConfig) -> ConfState {
    let voters: Vec<u64> = config.nodes.iter().copied().map(raft_id).collect();
    ConfState::from((voters, vec![]))
}

/// Raft entry for a WAL record, with every stored payload read back inline.
fn restored_entry(record: &EntryRecord, store: &dyn RequestStore) -> anyhow::Result<Entry> {
    let data = if record.normal && !record.data.is_empty() {
        let proposal = ProposalBatch::decode(&record.data)
            .with_context(|| format!("corrupt WAL entry at index {}", record.index))?;
        let requests = proposal
            .requests
            .into_iter()
            .map(|request| {
                let data = match request.data {
                    DataRef::Inline(data) => data,
                    DataRef::Stored(_) => {
                        let key = request.key();
                        store.get(&key).with_context(|| {
                            format!("could not restore request {key} at index {}", record.index)
                        })?
                    }
                };
                Ok(RequestRef {
                    data: DataRef::Inline(data),
                    ..request
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        ProposalBatch { requests }.encode()?
    } else {
        record.data.clone()
    };

    let mut entry = Entry::default();
    entry.index = record.index;
    entry.term = record.term;
    entry.data = data.into();
    if record.normal {
        entry.set_entry_type(EntryType::EntryNormal);
    } else {
        entry.set_entry_type(EntryType::EntryConfChange);
    }
    Ok(entry)
}

/// WAL form of an entry: request payloads move to the request store and the
/// entry keeps only their digests.
fn persist_entry(entry: &Entry, persist: &mut Vec<Persist>) -> anyhow::Result<()> {
    let normal = entry.entry_type() == EntryType::EntryNormal;
    let data = if normal && !entry.data.is_empty() {
        let proposal = ProposalBatch::decode(&entry.data)
            .with_context(|| format!("corrupt entry at index {}", entry.index))?;
        let mut requests = Vec::with_capacity(proposal.requests.len());
        for request in proposal.requests {
            let key = request.key();
            if let DataRef::Inline(data) = request.data {
                persist.push(Persist::Request { key, data });
            }
            requests.push(RequestRef {
                client_id: key.client_id,
                req_no: key.req_no,
                data: DataRef::Stored(key.digest),
            });
        }
        ProposalBatch { requests }.encode()?
    } else {
        entry.data.to_vec()
    };
    persist.push(Persist::Log(WalRecord::Entry {
        index: entry.index,
        term: entry.term,
        normal,
        data,
    }));
    Ok(())
}

impl ConsensusEngine for RaftEngine {
    fn tick(&mut self) -> Result<(), EngineError> {
        self.raw.tick();
        self.observe_role();
        self.propose_pending()
    }

    fn step(&mut self, from: NodeId, msg: &[u8]) -> Result<(), EngineError> {
        let msg = Message::decode(msg).map_err(|err| {
            EngineError::Rejected(format!("undecodable message from node {from}: {err}"))
        })?;
        if msg.from != raft_id(from) {
            return Err(EngineError::Rejected(format!(
                "node {from} sent a message on behalf of raft peer {}",
                msg.from
            )));
        }
        self.raw
            .step(msg)
            .map_err(|err| EngineError::Rejected(format!("message from node {from}: {err}")))?;
        self.observe_role();
        self.propose_pending()
    }

    fn propose(&mut self, request: ClientRequest) -> Result<(), EngineError> {
        let Some(window) = self.clients.get(&request.client_id) else {
            return Err(EngineError::Rejected(format!(
                "request from unknown client {}",
                request.client_id
            )));
        };
        let key = (request.client_id, request.req_no);
        if window.is_committed(request.req_no) || self.pending.contains_key(&key) {
            debug!(
                node = self.node_id,
                client = key.0,
                req_no = key.1,
                "ignoring duplicate request"
            );
            return Ok(());
        }

        self.queued.push(Persist::Request {
            key: RequestKey {
                client_id: request.client_id,
                req_no: request.req_no,
                digest: digest(&request.data),
            },
            data: request.data.clone(),
        });
        self.pending.insert(key, request.data);
        self.propose_pending()
    }

    fn ready(&mut self) -> Result<Option<ActionBatch>, EngineError> {
        if self.in_flight.is_some() {
            return Err(EngineError::BatchInFlight);
        }

        let mut batch = ActionBatch {
            persist: std::mem::take(&mut self.queued),
            ..Default::default()
        };

        if let Some(carried) = self.carried.take() {
            if carried.commit.is_some() {
                let hard_state = self.raw.raft.hard_state();
                batch.persist.push(Persist::Log(WalRecord::HardState {
                    term: hard_state.term,
                    vote: hard_state.vote,
                    commit: hard_state.commit,
                }));
            }
            batch.send = self.outbound(carried.messages);
            batch.commits = self.commit_entries(carried.committed)?;
            self.in_flight = Some(InFlight::Light);
            return Ok(Some(batch));
        }

        if !self.raw.has_ready() {
            if batch.is_empty() {
                return Ok(None);
            }
            self.in_flight = Some(InFlight::Detached);
            return Ok(Some(batch));
        }

        let mut ready = self.raw.ready();
        if !ready.snapshot().is_empty() {
            let snapshot = ready.snapshot();
            batch.state_transfer = Some(StateTransfer {
                seq: snapshot.get_metadata().index,
                value: snapshot.data.to_vec(),
            });
        }
        for entry in ready.entries() {
            persist_entry(entry, &mut batch.persist)?;
        }
        if let Some(hard_state) = ready.hs() {
            batch.persist.push(Persist::Log(WalRecord::HardState {
                term: hard_state.term,
                vote: hard_state.vote,
                commit: hard_state.commit,
            }));
        }
        let mut messages = ready.take_messages();
        messages.extend(ready.take_persisted_messages());
        batch.send = self.outbound(messages);
        batch.commits = self.commit_entries(ready.take_committed_entries())?;

        self.in_flight = Some(InFlight::Ready(ready));
        Ok(Some(batch))
    }

    fn add_results(&mut self, results: ResultBatch) -> Result<(), EngineError> {
        let in_flight = self.in_flight.take().ok_or(EngineError::NoBatchInFlight)?;

        if let Some(checkpoint) = results.checkpoints.last() {
            self.last_checkpoint = Some(checkpoint.seq);
        }
        if let Some(transferred) = results.transferred {
            info!(node = self.node_id, seq = transferred.seq, "adopting transferred state");
            self.adopt(transferred.state);
            self.applied = self.applied.max(transferred.seq);
        }
        if let Some(seq) = results.applied_through {
            self.applied = self.applied.max(seq);
        }

        match in_flight {
            InFlight::Ready(ready) => self.advance(ready)?,
            InFlight::Light => self.raw.advance_apply(),
            InFlight::Detached => {}
        }

        self.observe_role();
        self.propose_pending()
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            node_id: self.node_id,
            role: format!("{:?}", self.raw.raft.state),
            leader: self.leader(),
            term: self.raw.raft.term,
            committed: self.raw.raft.raft_log.committed,
            applied: self.applied,
            last_checkpoint: self.last_checkpoint,
            pending_requests: self.pending.len(),
        }
    }
}

/// Builds [`RaftEngine`]s for the replica driver.
pub struct RaftEngineBuilder {
    config: EngineConfig,
    watermarks: Arc<WatermarkTable>,
}

impl RaftEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            watermarks: Arc::new(WatermarkTable::new()),
        }
    }
}

impl EngineBuilder for RaftEngineBuilder {
    type Engine = RaftEngine;

    fn bootstrap(
        &self,
        initial: NetworkState,
        checkpoint_value: Vec<u8>,
    ) -> anyhow::Result<RaftEngine> {
        RaftEngine::bootstrap(
            &self.config,
            initial,
            checkpoint_value,
            Arc::clone(&self.watermarks),
        )
    }

    fn restart(
        &self,
        recovered: RecoveredLog,
        store: &dyn RequestStore,
    ) -> anyhow::Result<RaftEngine> {
        RaftEngine::restart(&self.config, recovered, store, Arc::clone(&self.watermarks))
    }

    fn watermarks(&self) -> Arc<WatermarkTable> {
        Arc::clone(&self.watermarks)
    }
}
