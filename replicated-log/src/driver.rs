//! Replica driver: owns the engine and runs the event loop.
//!
//! # Lifecycle
//!
//! `Starting → Running → Draining → Stopped`
//!
//! - **Starting**: open storage, register handlers, start the transport and
//!   either bootstrap the engine (empty WAL) or restart it from the WAL.
//! - **Running**: a single thread selects over the ticker, the engine's
//!   ingress channel and the shutdown signal. After every event it drains
//!   the engine's ready batches through the processor.
//! - **Draining**: processor workers are joined and storage is closed, then
//!   the transport is closed.
//! - **Stopped**: the exit signal fires, releasing `stop()` callers.
//!
//! Only the driver thread touches the engine, so the engine needs no locks.
//!
//! With an [`EventLog`] attached, every tick, ingress message, action batch
//! and result batch is recorded before the engine or processor sees it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, select, tick};
use tracing::{error, info, warn};

use crate::app::ApplicationLog;
use crate::config::NodeConfig;
use crate::directory::PeerClass;
use crate::engine::{
    ConsensusEngine, EngineBuilder, EngineError, EngineIngress, EngineStatus,
    INITIAL_CHECKPOINT_VALUE, Ingress,
};
use crate::eventlog::{Event, EventLog};
use crate::handler::Handlers;
use crate::processor::{PooledProcessor, Processor, SerialProcessor};
use crate::raft_engine::RaftEngineBuilder;
use crate::shutdown::ShutdownSignal;
use crate::storage::{FileRequestStore, FileWal, RequestStore, WriteAheadLog, recover};
use crate::transport::{Transport, TransportConfig};

const SEND_WORKERS: usize = 4;

/// Lifecycle of a replica; see the module docs for what each state covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// Shared, logged view of the driver's lifecycle state.
#[derive(Clone)]
pub struct StateCell {
    node_id: u64,
    state: Arc<Mutex<ReplicaState>>,
}

impl StateCell {
    pub fn new(node_id: u64) -> Self {
        Self {
            node_id,
            state: Arc::new(Mutex::new(ReplicaState::Starting)),
        }
    }

    pub fn get(&self) -> ReplicaState {
        *self.state.lock().expect("state poisoned")
    }

    fn set(&self, next: ReplicaState) {
        let mut state = self.state.lock().expect("state poisoned");
        if *state != next {
            info!(node = self.node_id, from = ?*state, to = ?next, "replica state");
            *state = next;
        }
    }
}

/// The event loop over one engine and one processor.
pub struct Driver<E, P> {
    engine: E,
    processor: P,
    ingress: Receiver<Ingress>,
    tick_interval: Duration,
    shutdown: ShutdownSignal,
    state: StateCell,
    events: Option<EventLog>,
}

impl<E: ConsensusEngine, P: Processor> Driver<E, P> {
    pub fn new(
        engine: E,
        processor: P,
        ingress: Receiver<Ingress>,
        tick_interval: Duration,
        shutdown: ShutdownSignal,
        state: StateCell,
    ) -> Self {
        Self {
            engine,
            processor,
            ingress,
            tick_interval,
            shutdown,
            state,
            events: None,
        }
    }

    /// Records every engine input and output to `log`.
    pub fn with_event_log(mut self, log: EventLog) -> Self {
        info!(node = self.state.node_id, path = %log.path().display(), "recording events");
        self.events = Some(log);
        self
    }

    /// Runs until shutdown or a fatal error, then drains the processor.
    pub fn run(mut self) -> Result<()> {
        self.state.set(ReplicaState::Running);
        let result = self.event_loop();
        self.state.set(ReplicaState::Draining);
        let drained = self.processor.shutdown().context("failed to drain processor");
        let finished = match self.events.as_mut() {
            Some(log) => log.finish(),
            None => Ok(()),
        };
        result.and(drained).and(finished)
    }

    pub fn status(&self) -> EngineStatus {
        self.engine.status()
    }

    fn event_loop(&mut self) -> Result<()> {
        let ticker = tick(self.tick_interval);
        // Owned handles, so the arms below may borrow `self` mutably.
        let ingress = self.ingress.clone();
        let stop = self.shutdown.receiver().clone();
        loop {
            self.drain_ready()?;
            select! {
                recv(ticker) -> _ => {
                    self.record(|| Event::Tick)?;
                    self.engine
                        .tick()
                        .map_err(|err| self.engine_failed(err, "tick"))?;
                }
                recv(ingress) -> msg => match msg {
                    Ok(input) => {
                        self.record(|| Event::Ingress(input.clone()))?;
                        self.ingest(input)?;
                    }
                    Err(_) => {
                        info!(node = self.state.node_id, "ingress closed");
                        return Ok(());
                    }
                },
                recv(stop) -> _ => {
                    info!(node = self.state.node_id, "stop requested");
                    return Ok(());
                }
            }
        }
    }

    fn ingest(&mut self, ingress: Ingress) -> Result<()> {
        match ingress {
            Ingress::Step { from, msg } => {
                let result = self.engine.step(from, &msg);
                self.absorb(result, "step")
            }
            Ingress::Propose(request) => {
                let result = self.engine.propose(request);
                self.absorb(result, "propose")
            }
        }
    }

    /// Appends the event built by `event` when recording is on.
    fn record(&mut self, event: impl FnOnce() -> Event) -> Result<()> {
        match self.events.as_mut() {
            Some(log) => log.record(event()).context("could not record event"),
            None => Ok(()),
        }
    }

    /// Rejected inputs are logged and dropped; anything else stops the node.
    fn absorb(&self, result: Result<(), EngineError>, op: &str) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(EngineError::Rejected(reason)) => {
                warn!(node = self.state.node_id, op, %reason, "engine rejected input");
                Ok(())
            }
            Err(err) => Err(self.engine_failed(err, op)),
        }
    }

    /// Hands every ready batch to the processor, one at a time.
    fn drain_ready(&mut self) -> Result<()> {
        loop {
            let batch = match self.engine.ready() {
                Ok(Some(batch)) => batch,
                Ok(None) => {
                    if let Some(log) = self.events.as_mut() {
                        log.flush().context("could not flush event log")?;
                    }
                    return Ok(());
                }
                Err(err) => return Err(self.engine_failed(err, "ready")),
            };
            self.record(|| Event::Actions(batch.clone()))?;
            let results = self
                .processor
                .process(batch)
                .context("failed to process action batch")?;
            self.record(|| Event::Results(results.clone()))?;
            self.engine
                .add_results(results)
                .map_err(|err| self.engine_failed(err, "add_results"))?;
        }
    }

    fn engine_failed(&self, err: EngineError, op: &str) -> anyhow::Error {
        let status = self.engine.status();
        error!(node = self.state.node_id, op, error = %err, "engine failed\n{status}");
        anyhow!(err).context(format!("consensus engine failed during {op}"))
    }
}

/// Where a replica keeps its state and how it processes batches.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Identity, peers and protocol timing of this node.
    pub node: NodeConfig,
    /// Directory of the write-ahead log. An empty WAL means a brand new
    /// network; anything else is a restart.
    pub wal_dir: PathBuf,
    /// Directory of the request payload store. Must survive restarts
    /// together with the WAL.
    pub request_store_dir: PathBuf,
    /// Use the pooled processor instead of the serial one.
    pub parallel: bool,
    /// Gzip event log to record engine inputs and outputs into, if any.
    pub event_log: Option<PathBuf>,
}

/// A node: transport, storage, engine and driver wired together.
///
/// `run` blocks the calling thread; `stop` may be called from any other
/// thread and returns once `run` has torn everything down.
pub struct Replica {
    config: ReplicaConfig,
    shutdown: ShutdownSignal,
    exited: ShutdownSignal,
    started: AtomicBool,
    state: StateCell,
    applied: Mutex<Option<Arc<AtomicU64>>>,
    listen_addr: Mutex<Option<std::net::SocketAddr>>,
}

impl Replica {
    pub fn new(config: ReplicaConfig) -> Self {
        let state = StateCell::new(config.node.id);
        Self {
            config,
            shutdown: ShutdownSignal::new(),
            exited: ShutdownSignal::new(),
            started: AtomicBool::new(false),
            state,
            applied: Mutex::new(None),
            listen_addr: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ReplicaState {
        self.state.get()
    }

    /// Requests applied by this replica's application log so far.
    pub fn applied_count(&self) -> u64 {
        self.applied
            .lock()
            .expect("replica poisoned")
            .as_ref()
            .map(|counter| counter.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Address the transport actually bound, once running.
    pub fn listen_addr(&self) -> Option<std::net::SocketAddr> {
        *self.listen_addr.lock().expect("replica poisoned")
    }

    /// Token that stops the replica when triggered.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Runs the replica on the calling thread until stopped or failed, using
    /// file-backed storage and the raft engine.
    pub fn run(&self) -> Result<()> {
        let builder = RaftEngineBuilder::new(self.config.node.engine_config());
        let wal = FileWal::open(&self.config.wal_dir).context("could not open WAL")?;
        let store = Arc::new(
            FileRequestStore::open(&self.config.request_store_dir)
                .context("could not open request store")?,
        );
        self.run_with(builder, wal, store)
    }

    /// Runs the replica with injected engine and storage.
    pub fn run_with<B, W, R>(&self, builder: B, wal: W, store: Arc<R>) -> Result<()>
    where
        B: EngineBuilder,
        W: WriteAheadLog + 'static,
        R: RequestStore + 'static,
    {
        if self.started.swap(true, Ordering::SeqCst) {
            anyhow::bail!("replica {} already started", self.config.node.id);
        }
        let _exit = ExitGuard {
            state: self.state.clone(),
            exited: self.exited.clone(),
        };
        self.state.set(ReplicaState::Starting);
        let node = &self.config.node;

        let first_start = wal.is_empty().context("could not query WAL")?;
        let (ingress, ingress_rx) = EngineIngress::channel();

        let transport = Arc::new(Transport::new(TransportConfig {
            id: node.id,
            class: PeerClass::Node,
            listen: Some(node.listen_address.clone()),
            identity: node.identity()?,
            directory: node.directory()?,
        }));
        transport.handle(Handlers::replica(ingress, builder.watermarks()));
        transport.start().context("could not start networking")?;
        *self.listen_addr.lock().expect("replica poisoned") = transport.local_addr();

        let engine = if first_start {
            info!(node = node.id, "bootstrapping new network state");
            builder
                .bootstrap(node.initial_network_state(), INITIAL_CHECKPOINT_VALUE.to_vec())
                .context("could not bootstrap engine")?
        } else {
            let records = wal.load().context("could not load WAL")?;
            let recovered = recover(records).context("could not recover from WAL")?;
            builder
                .restart(recovered, &*store)
                .context("could not restart engine")?
        };

        let app = ApplicationLog::new(node.id, Arc::clone(&store));
        *self.applied.lock().expect("replica poisoned") = Some(app.applied_counter());

        let processor: Box<dyn Processor> = if self.config.parallel {
            Box::new(PooledProcessor::new(
                wal,
                store,
                app,
                Arc::clone(&transport),
                SEND_WORKERS,
            )?)
        } else {
            Box::new(SerialProcessor::new(wal, store, app, Arc::clone(&transport)))
        };

        let mut driver = Driver::new(
            engine,
            processor,
            ingress_rx,
            node.tick_interval(),
            self.shutdown.clone(),
            self.state.clone(),
        );
        if let Some(path) = &self.config.event_log {
            driver = driver.with_event_log(EventLog::create(path)?);
        }
        let result = driver.run();
        transport.close();
        if let Err(err) = &result {
            error!(node = node.id, error = ?err, "replica stopped with error");
        }
        result
    }

    /// Triggers shutdown and blocks until the driver has fully stopped.
    /// Returns immediately if the replica never started.
    pub fn stop(&self) {
        self.shutdown.trigger();
        if self.started.load(Ordering::SeqCst) {
            self.exited.wait();
        }
    }
}

/// Marks the replica stopped and releases `stop()` callers on every exit
/// path out of `run_with`.
struct ExitGuard {
    state: StateCell,
    exited: ShutdownSignal,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.state.set(ReplicaState::Stopped);
        self.exited.trigger();
    }
}
