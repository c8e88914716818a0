//! Executes [`ActionBatch`]es on behalf of the replica driver.
//!
//! Every batch is processed in the same order:
//!
//! 1. Persist request payloads and WAL records, then sync the WAL.
//! 2. Send outbound messages.
//! 3. Adopt a transferred checkpoint, if any.
//! 4. Apply commits and produce checkpoint values, in batch order.
//!
//! [`SerialProcessor`] does all of it on the driver thread.
//! [`PooledProcessor`] keeps persistence and commits on the driver thread
//! but fans sends out to a bounded worker pool, waiting for every send of a
//! batch before moving on.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Sender, bounded, unbounded};
use tracing::{debug, warn};

use crate::app::ApplicationLog;
use crate::engine::{
    ActionBatch, Checkpoint, Commit, NodeId, Outbound, Persist, ResultBatch, StateTransfer,
    Transferred, WalRecord,
};
use crate::storage::{RequestStore, WriteAheadLog};
use crate::transport::{Transport, TransportError};
use crate::wire::Envelope;

/// Outbound path for consensus protocol messages.
pub trait Link: Send + Sync {
    fn send(&self, dest: NodeId, msg: Vec<u8>) -> Result<(), TransportError>;
}

impl Link for Transport {
    fn send(&self, dest: NodeId, msg: Vec<u8>) -> Result<(), TransportError> {
        let payload = Envelope::Protocol(msg)
            .encode()
            .map_err(|err| TransportError::Protocol {
                dest,
                detail: err.to_string(),
            })?;
        Transport::send(self, dest, payload)
    }
}

/// Turns one [`ActionBatch`] into its [`ResultBatch`].
///
/// The driver hands over a batch only after the previous one's results went
/// back to the engine, so implementations never see two batches at once.
/// Any error is fatal to the replica.
pub trait Processor {
    /// Runs every stage of `batch` in order. Returns once the WAL is synced,
    /// every send has been handed to the link and every commit applied.
    fn process(&mut self, batch: ActionBatch) -> Result<ResultBatch>;

    /// Releases worker resources; called once while the driver drains.
    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<P: Processor + ?Sized> Processor for Box<P> {
    fn process(&mut self, batch: ActionBatch) -> Result<ResultBatch> {
        (**self).process(batch)
    }

    fn shutdown(&mut self) -> Result<()> {
        (**self).shutdown()
    }
}

/// State shared by both processors: storage and the application.
struct Stages<W, R: ?Sized> {
    wal: W,
    store: Arc<R>,
    app: ApplicationLog<R>,
}

impl<W: WriteAheadLog, R: RequestStore + ?Sized> Stages<W, R> {
    fn persist(&mut self, persist: Vec<Persist>) -> Result<()> {
        let mut records = Vec::new();
        for item in persist {
            match item {
                Persist::Request { key, data } => self
                    .store
                    .put(&key, &data)
                    .with_context(|| format!("could not store request {key}"))?,
                Persist::Log(record) => records.push(record),
            }
        }
        if !records.is_empty() {
            self.wal
                .append(&records)
                .context("could not persist WAL records")?;
        }
        Ok(())
    }

    fn apply(
        &mut self,
        state_transfer: Option<StateTransfer>,
        commits: Vec<Commit>,
    ) -> Result<ResultBatch> {
        let mut results = ResultBatch::default();

        if let Some(transfer) = state_transfer {
            let state = self
                .app
                .transfer_to(transfer.seq, &transfer.value)
                .with_context(|| format!("could not transfer to checkpoint {}", transfer.seq))?;
            results.transferred = Some(Transferred {
                seq: transfer.seq,
                state,
            });
            results.applied_through = Some(transfer.seq);
        }

        for commit in commits {
            match commit {
                Commit::Entry(entry) => {
                    self.app
                        .apply(&entry)
                        .with_context(|| format!("could not apply entry {}", entry.seq_no))?;
                    results.applied_through = Some(entry.seq_no);
                }
                Commit::Checkpoint { seq, state } => {
                    let value = self
                        .app
                        .snapshot(&state)
                        .with_context(|| format!("could not snapshot at {seq}"))?;
                    self.wal
                        .append(&[WalRecord::Checkpoint {
                            seq,
                            value: value.clone(),
                        }])
                        .context("could not persist checkpoint")?;
                    debug!(seq, len = value.len(), "checkpoint taken");
                    results.checkpoints.push(Checkpoint { seq, value });
                }
            }
        }
        Ok(results)
    }

    fn close(&mut self) -> Result<()> {
        self.wal.close().context("could not close WAL")?;
        self.store.close().context("could not close request store")?;
        Ok(())
    }
}

/// Processes every stage of a batch on the calling thread.
pub struct SerialProcessor<W, R: ?Sized, L: ?Sized> {
    stages: Stages<W, R>,
    link: Arc<L>,
}

impl<W, R, L> SerialProcessor<W, R, L>
where
    W: WriteAheadLog,
    R: RequestStore + ?Sized,
    L: Link + ?Sized,
{
    pub fn new(wal: W, store: Arc<R>, app: ApplicationLog<R>, link: Arc<L>) -> Self {
        Self {
            stages: Stages { wal, store, app },
            link,
        }
    }
}

impl<W, R, L> Processor for SerialProcessor<W, R, L>
where
    W: WriteAheadLog,
    R: RequestStore + ?Sized,
    L: Link + ?Sized,
{
    fn process(&mut self, batch: ActionBatch) -> Result<ResultBatch> {
        self.stages.persist(batch.persist)?;
        for Outbound { to, payload } in batch.send {
            self.link
                .send(to, payload)
                .with_context(|| format!("could not send to node {to}"))?;
        }
        self.stages.apply(batch.state_transfer, batch.commits)
    }

    fn shutdown(&mut self) -> Result<()> {
        self.stages.close()
    }
}

struct SendJob {
    outbound: Outbound,
    done: Sender<Result<(), TransportError>>,
}

/// Sends on a fixed pool of worker threads; everything else stays on the
/// driver thread.
pub struct PooledProcessor<W, R: ?Sized> {
    stages: Stages<W, R>,
    jobs: Option<Sender<SendJob>>,
    workers: Vec<JoinHandle<()>>,
}

impl<W, R> PooledProcessor<W, R>
where
    W: WriteAheadLog,
    R: RequestStore + ?Sized,
{
    pub fn new<L>(
        wal: W,
        store: Arc<R>,
        app: ApplicationLog<R>,
        link: Arc<L>,
        workers: usize,
    ) -> Result<Self>
    where
        L: Link + ?Sized + 'static,
    {
        let workers = workers.max(1);
        let (jobs_tx, jobs_rx) = bounded::<SendJob>(workers * 4);
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let jobs = jobs_rx.clone();
            let link = Arc::clone(&link);
            let handle = thread::Builder::new()
                .name(format!("send-worker-{index}"))
                .spawn(move || {
                    for job in jobs {
                        let result = link.send(job.outbound.to, job.outbound.payload);
                        let _ = job.done.send(result);
                    }
                })
                .context("failed to spawn send worker")?;
            handles.push(handle);
        }
        Ok(Self {
            stages: Stages { wal, store, app },
            jobs: Some(jobs_tx),
            workers: handles,
        })
    }
}

impl<W, R> Processor for PooledProcessor<W, R>
where
    W: WriteAheadLog,
    R: RequestStore + ?Sized,
{
    fn process(&mut self, batch: ActionBatch) -> Result<ResultBatch> {
        self.stages.persist(batch.persist)?;

        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| anyhow!("processor has been shut down"))?;
        let (done_tx, done_rx) = unbounded();
        let mut expected = 0;
        for outbound in batch.send {
            jobs.send(SendJob {
                outbound,
                done: done_tx.clone(),
            })
            .map_err(|_| anyhow!("send workers have exited"))?;
            expected += 1;
        }
        drop(done_tx);

        let mut failure = None;
        for _ in 0..expected {
            let result = done_rx
                .recv()
                .map_err(|_| anyhow!("send worker exited mid-batch"))?;
            if let Err(err) = result {
                failure.get_or_insert(err);
            }
        }
        if let Some(err) = failure {
            return Err(anyhow::Error::new(err).context("could not send batch"));
        }

        self.stages.apply(batch.state_transfer, batch.commits)
    }

    fn shutdown(&mut self) -> Result<()> {
        // Closing the job channel ends every worker's loop.
        self.jobs.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("send worker panicked");
            }
        }
        self.stages.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        ClientState, CommittedEntry, DataRef, NetworkConfig, NetworkState, RequestKey, RequestRef,
        digest,
    };
    use crate::storage::{MemRequestStore, MemWal};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingLink {
        sent: Mutex<Vec<(NodeId, Vec<u8>)>>,
    }

    impl Link for RecordingLink {
        fn send(&self, dest: NodeId, msg: Vec<u8>) -> Result<(), TransportError> {
            if dest == 99 {
                return Err(TransportError::UnknownPeer(dest));
            }
            self.sent.lock().unwrap().push((dest, msg));
            Ok(())
        }
    }

    fn network_state() -> NetworkState {
        NetworkState {
            config: NetworkConfig {
                nodes: vec![0, 1],
                number_of_buckets: 1,
                checkpoint_interval: 2,
            },
            clients: vec![ClientState::new(0, 10)],
        }
    }

    fn batch_with_stored_request() -> ActionBatch {
        let data = b"my-request-0.0.data".to_vec();
        let key = RequestKey {
            client_id: 0,
            req_no: 0,
            digest: digest(&data),
        };
        ActionBatch {
            persist: vec![
                Persist::Request {
                    key,
                    data: data.clone(),
                },
                Persist::Log(WalRecord::HardState {
                    term: 1,
                    vote: 1,
                    commit: 1,
                }),
            ],
            send: vec![
                Outbound {
                    to: 1,
                    payload: vec![1],
                },
                Outbound {
                    to: 0,
                    payload: vec![2],
                },
            ],
            state_transfer: None,
            commits: vec![
                Commit::Entry(CommittedEntry {
                    seq_no: 2,
                    requests: vec![RequestRef {
                        client_id: 0,
                        req_no: 0,
                        data: DataRef::Stored(key.digest),
                    }],
                }),
                Commit::Checkpoint {
                    seq: 2,
                    state: network_state(),
                },
            ],
        }
    }

    #[test]
    fn test_serial_processor_runs_every_stage() -> Result<()> {
        let store = Arc::new(MemRequestStore::new());
        let app = ApplicationLog::new(0, Arc::clone(&store));
        let counter = app.applied_counter();
        let link = Arc::new(RecordingLink::default());
        let wal = MemWal::new();
        let mut processor = SerialProcessor::new(wal.clone(), store, app, Arc::clone(&link));

        let results = processor.process(batch_with_stored_request())?;

        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(results.applied_through, Some(2));
        assert_eq!(results.checkpoints.len(), 1);
        assert_eq!(&results.checkpoints[0].value[..8], &1u64.to_be_bytes());
        assert_eq!(link.sent.lock().unwrap().len(), 2);

        let records = wal.records();
        assert!(matches!(records[0], WalRecord::HardState { .. }));
        assert!(matches!(records[1], WalRecord::Checkpoint { seq: 2, .. }));
        Ok(())
    }

    #[test]
    fn test_pooled_processor_waits_for_all_sends() -> Result<()> {
        let store = Arc::new(MemRequestStore::new());
        let app = ApplicationLog::new(0, Arc::clone(&store));
        let link = Arc::new(RecordingLink::default());
        let mut processor =
            PooledProcessor::new(MemWal::new(), store, app, Arc::clone(&link), 3)?;

        let results = processor.process(batch_with_stored_request())?;
        assert_eq!(results.applied_through, Some(2));
        assert_eq!(link.sent.lock().unwrap().len(), 2);
        processor.shutdown()?;
        Ok(())
    }

    #[test]
    fn test_unknown_destination_is_fatal() -> Result<()> {
        let store = Arc::new(MemRequestStore::new());
        let app = ApplicationLog::new(0, Arc::clone(&store));
        let mut processor = PooledProcessor::new(
            MemWal::new(),
            store,
            app,
            Arc::new(RecordingLink::default()),
            2,
        )?;

        let mut batch = ActionBatch::default();
        batch.send.push(Outbound {
            to: 99,
            payload: vec![],
        });
        let err = processor.process(batch).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TransportError>(),
            Some(TransportError::UnknownPeer(99))
        ));
        processor.shutdown()?;
        Ok(())
    }

    #[test]
    fn test_missing_payload_is_fatal() -> Result<()> {
        let store = Arc::new(MemRequestStore::new());
        let app = ApplicationLog::new(0, Arc::clone(&store));
        let mut processor = SerialProcessor::new(
            MemWal::new(),
            store,
            app,
            Arc::new(RecordingLink::default()),
        );

        let mut batch = batch_with_stored_request();
        batch.persist.clear();
        assert!(processor.process(batch).is_err());
        Ok(())
    }
}
