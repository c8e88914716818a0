//! The replicated application: an append-only log that counts applied
//! requests.
//!
//! Each committed entry is applied exactly once, in sequence order. Requests
//! that arrive as digests are fetched from the request store first; a missing
//! payload means the node cannot make progress and is fatal.

use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, ensure};
use tracing::{debug, info};

use crate::engine::{CommittedEntry, DataRef, NetworkState};
use crate::storage::RequestStore;

/// Bytes of request payload included in debug traces.
const TRACE_PREFIX_LEN: usize = 32;

pub struct ApplicationLog<R: ?Sized> {
    node_id: u64,
    store: Arc<R>,
    applied: Arc<AtomicU64>,
    last_seq: Option<u64>,
}

impl<R: RequestStore + ?Sized> ApplicationLog<R> {
    pub fn new(node_id: u64, store: Arc<R>) -> Self {
        Self {
            node_id,
            store,
            applied: Arc::new(AtomicU64::new(0)),
            last_seq: None,
        }
    }

    /// Number of requests applied so far.
    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }

    /// Read-only handle to the applied counter for observers on other
    /// threads. Only this log ever writes it.
    pub fn applied_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.applied)
    }

    /// Applies every request of `entry` in order.
    pub fn apply(&mut self, entry: &CommittedEntry) -> Result<()> {
        if let Some(last) = self.last_seq {
            ensure!(
                entry.seq_no > last,
                "entry seq_no={} is not after last applied seq_no={last}",
                entry.seq_no
            );
        }

        for request in &entry.requests {
            let data = match &request.data {
                DataRef::Inline(data) => Cow::Borrowed(data.as_slice()),
                DataRef::Stored(_) => {
                    let key = request.key();
                    Cow::Owned(self.store.get(&key).with_context(|| {
                        format!("could not get request {key} for seq_no={}", entry.seq_no)
                    })?)
                }
            };
            let prefix = &data[..data.len().min(TRACE_PREFIX_LEN)];
            debug!(
                node = self.node_id,
                client = request.client_id,
                req_no = request.req_no,
                len = data.len(),
                prefix = %String::from_utf8_lossy(prefix).trim_end_matches('\0'),
                "applying request"
            );
            self.applied.fetch_add(1, Ordering::SeqCst);
        }

        self.last_seq = Some(entry.seq_no);
        info!(
            node = self.node_id,
            seq_no = entry.seq_no,
            requests = entry.requests.len(),
            applied = self.applied_count(),
            "committed entry"
        );
        Ok(())
    }

    /// Encodes the current state: 8-byte big-endian applied count followed
    /// by the serialized network state.
    pub fn snapshot(&self, state: &NetworkState) -> Result<Vec<u8>> {
        let mut value = self.applied_count().to_be_bytes().to_vec();
        let encoded = bincode::serialize(state).context("could not encode network state")?;
        value.extend_from_slice(&encoded);
        Ok(value)
    }

    /// Replaces local state with a checkpoint taken at `seq`, returning the
    /// network state embedded in it.
    pub fn transfer_to(&mut self, seq: u64, value: &[u8]) -> Result<NetworkState> {
        ensure!(
            value.len() >= 8,
            "checkpoint value of {} bytes is too short",
            value.len()
        );
        let mut count = [0u8; 8];
        count.copy_from_slice(&value[..8]);
        let count = u64::from_be_bytes(count);
        let state: NetworkState = bincode::deserialize(&value[8..])
            .context("could not decode checkpoint value to network state")?;

        self.applied.store(count, Ordering::SeqCst);
        self.last_seq = Some(seq);
        info!(node = self.node_id, seq, applied = count, "completed state transfer");
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ClientState, NetworkConfig, RequestRef, digest};
    use crate::storage::{MemRequestStore, ScriptedRequestStore, StoreError};

    fn network_state() -> NetworkState {
        NetworkState {
            config: NetworkConfig {
                nodes: vec![0, 1, 2, 3],
                number_of_buckets: 1,
                checkpoint_interval: 20,
            },
            clients: vec![ClientState::new(0, 5000)],
        }
    }

    fn stored(req_no: u64, data: &[u8]) -> RequestRef {
        RequestRef {
            client_id: 0,
            req_no,
            data: DataRef::Stored(digest(data)),
        }
    }

    #[test]
    fn test_apply_counts_every_request() -> Result<()> {
        let store = Arc::new(MemRequestStore::new());
        let mut app = ApplicationLog::new(0, store.clone());

        let mut req_no = 0;
        for seq_no in 1..=3 {
            let mut requests = Vec::new();
            for _ in 0..2 {
                let data = format!("request-{req_no}").into_bytes();
                let request = stored(req_no, &data);
                store.put(&request.key(), &data)?;
                requests.push(request);
                req_no += 1;
            }
            app.apply(&CommittedEntry { seq_no, requests })?;
        }

        assert_eq!(app.applied_count(), 6);
        Ok(())
    }

    #[test]
    fn test_inline_requests_skip_the_store() -> Result<()> {
        let store = Arc::new(ScriptedRequestStore::new([]));
        let mut app = ApplicationLog::new(0, store);
        app.apply(&CommittedEntry {
            seq_no: 1,
            requests: vec![RequestRef {
                client_id: 0,
                req_no: 0,
                data: DataRef::Inline(b"inline".to_vec()),
            }],
        })?;
        assert_eq!(app.applied_count(), 1);
        Ok(())
    }

    #[test]
    fn test_store_miss_is_fatal() {
        let store = Arc::new(ScriptedRequestStore::new([
            Ok(b"first".to_vec()),
            Err(StoreError::NotFound(stored(1, b"second").key())),
        ]));
        let mut app = ApplicationLog::new(0, store);
        let err = app
            .apply(&CommittedEntry {
                seq_no: 7,
                requests: vec![stored(0, b"first"), stored(1, b"second")],
            })
            .unwrap_err();

        assert!(err.to_string().contains("seq_no=7"), "{err:#}");
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::NotFound(_))
        ));
        assert_eq!(app.applied_count(), 1);
    }

    #[test]
    fn test_entries_must_advance() -> Result<()> {
        let mut app = ApplicationLog::new(0, Arc::new(MemRequestStore::new()));
        app.apply(&CommittedEntry {
            seq_no: 4,
            requests: vec![],
        })?;
        assert!(app
            .apply(&CommittedEntry {
                seq_no: 4,
                requests: vec![],
            })
            .is_err());
        Ok(())
    }

    #[test]
    fn test_transfer_restores_snapshot() -> Result<()> {
        let store = Arc::new(MemRequestStore::new());
        let mut source = ApplicationLog::new(0, store.clone());
        source.apply(&CommittedEntry {
            seq_no: 1,
            requests: vec![
                RequestRef {
                    client_id: 0,
                    req_no: 0,
                    data: DataRef::Inline(b"a".to_vec()),
                },
                RequestRef {
                    client_id: 0,
                    req_no: 1,
                    data: DataRef::Inline(b"b".to_vec()),
                },
            ],
        })?;
        let value = source.snapshot(&network_state())?;

        let mut target = ApplicationLog::new(1, store);
        let state = target.transfer_to(1, &value)?;
        assert_eq!(target.applied_count(), 2);
        assert_eq!(state, network_state());
        Ok(())
    }

    #[test]
    fn test_transfer_rejects_short_value() {
        let mut app = ApplicationLog::new(0, Arc::new(MemRequestStore::new()));
        assert!(app.transfer_to(1, &[0, 0, 0]).is_err());
        assert_eq!(app.applied_count(), 0);
    }
}
