//! Persistence capabilities used by the processor and the application log.
//!
//! - [`RequestStore`]: request payloads keyed by `(client, req_no, digest)`.
//! - [`WriteAheadLog`]: append-only sequence of [`WalRecord`]s.
//!
//! Both come with a file-backed implementation used by the binary and
//! in-memory doubles for tests. [`ScriptedRequestStore`] replays a queue of
//! canned `get` results so failure paths can be exercised deterministically.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use thiserror::Error;
use tracing::warn;

use crate::engine::{
    Checkpoint, EntryRecord, HardStateRecord, RecoveredLog, RequestKey, WalRecord, digest,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request not found: {0}")]
    NotFound(RequestKey),
    #[error("stored payload for {0} does not match its digest")]
    Corrupt(RequestKey),
    #[error("request store I/O: {0}")]
    Io(#[from] io::Error),
}

/// Payload storage for client requests.
pub trait RequestStore: Send + Sync {
    fn put(&self, key: &RequestKey, data: &[u8]) -> Result<(), StoreError>;

    fn get(&self, key: &RequestKey) -> Result<Vec<u8>, StoreError>;

    fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// One file per request under a directory.
pub struct FileRequestStore {
    dir: PathBuf,
}

impl FileRequestStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create request store {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &RequestKey) -> PathBuf {
        self.dir.join(format!(
            "{}-{}-{}",
            key.client_id,
            key.req_no,
            hex::encode(key.digest)
        ))
    }
}

impl RequestStore for FileRequestStore {
    fn put(&self, key: &RequestKey, data: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key);
        if path.exists() {
            return Ok(());
        }
        let tmp = path.with_extension("tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_data()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn get(&self, key: &RequestKey) -> Result<Vec<u8>, StoreError> {
        let data = match fs::read(self.path_for(key)) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(*key));
            }
            Err(err) => return Err(err.into()),
        };
        if digest(&data) != key.digest {
            return Err(StoreError::Corrupt(*key));
        }
        Ok(data)
    }
}

#[derive(Default)]
pub struct MemRequestStore {
    requests: Mutex<HashMap<RequestKey, Vec<u8>>>,
}

impl MemRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.requests.lock().expect("request store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RequestStore for MemRequestStore {
    fn put(&self, key: &RequestKey, data: &[u8]) -> Result<(), StoreError> {
        self.requests
            .lock()
            .expect("request store poisoned")
            .insert(*key, data.to_vec());
        Ok(())
    }

    fn get(&self, key: &RequestKey) -> Result<Vec<u8>, StoreError> {
        self.requests
            .lock()
            .expect("request store poisoned")
            .get(key)
            .cloned()
            .ok_or(StoreError::NotFound(*key))
    }
}

/// Answers `get` from a queue of canned results; an exhausted queue answers
/// `NotFound`. Every `put` is recorded.
#[derive(Default)]
pub struct ScriptedRequestStore {
    responses: Mutex<VecDeque<Result<Vec<u8>, StoreError>>>,
    puts: Mutex<Vec<RequestKey>>,
}

impl ScriptedRequestStore {
    pub fn new(responses: impl IntoIterator<Item = Result<Vec<u8>, StoreError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            puts: Mutex::new(Vec::new()),
        }
    }

    pub fn puts(&self) -> Vec<RequestKey> {
        self.puts.lock().expect("request store poisoned").clone()
    }
}

impl RequestStore for ScriptedRequestStore {
    fn put(&self, key: &RequestKey, _data: &[u8]) -> Result<(), StoreError> {
        self.puts.lock().expect("request store poisoned").push(*key);
        Ok(())
    }

    fn get(&self, key: &RequestKey) -> Result<Vec<u8>, StoreError> {
        self.responses
            .lock()
            .expect("request store poisoned")
            .pop_front()
            .unwrap_or(Err(StoreError::NotFound(*key)))
    }
}

/// Append-only durable record log.
pub trait WriteAheadLog: Send {
    fn is_empty(&self) -> Result<bool>;

    /// Appends and syncs `records` in order.
    fn append(&mut self, records: &[WalRecord]) -> Result<()>;

    fn load(&self) -> Result<Vec<WalRecord>>;

    fn close(&mut self) -> Result<()>;
}

/// Length-prefixed bincode records in a single file.
///
/// Layout per record: 4-byte big-endian length, then the bincode bytes. A
/// torn trailing record (crash mid-write) is ignored on load.
pub struct FileWal {
    path: PathBuf,
    file: Option<File>,
}

impl FileWal {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create WAL directory {}", dir.display()))?;
        let path = dir.join("wal.log");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open WAL {}", path.display()))?;
        Ok(Self {
            path,
            file: Some(file),
        })
    }
}

impl WriteAheadLog for FileWal {
    fn is_empty(&self) -> Result<bool> {
        let metadata = fs::metadata(&self.path)
            .with_context(|| format!("failed to stat WAL {}", self.path.display()))?;
        Ok(metadata.len() == 0)
    }

    fn append(&mut self, records: &[WalRecord]) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            bail!("WAL {} is closed", self.path.display());
        };
        let mut buf = Vec::new();
        for record in records {
            let bytes = bincode::serialize(record).context("failed to encode WAL record")?;
            let len = u32::try_from(bytes.len()).context("WAL record too large")?;
            buf.extend_from_slice(&len.to_be_bytes());
            buf.extend_from_slice(&bytes);
        }
        file.write_all(&buf).context("failed to write WAL")?;
        file.sync_data().context("failed to sync WAL")?;
        Ok(())
    }

    fn load(&self) -> Result<Vec<WalRecord>> {
        let mut bytes = Vec::new();
        File::open(&self.path)
            .and_then(|mut file| file.read_to_end(&mut bytes))
            .with_context(|| format!("failed to read WAL {}", self.path.display()))?;

        let mut records = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            if offset + 4 > bytes.len() {
                warn!(offset, "ignoring torn WAL length prefix");
                break;
            }
            let mut len_buf = [0u8; 4];
            len_buf.copy_from_slice(&bytes[offset..offset + 4]);
            let len = u32::from_be_bytes(len_buf) as usize;
            let start = offset + 4;
            if start + len > bytes.len() {
                warn!(offset, len, "ignoring torn WAL record");
                break;
            }
            let record = bincode::deserialize(&bytes[start..start + len])
                .with_context(|| format!("corrupt WAL record at offset {offset}"))?;
            records.push(record);
            offset = start + len;
        }
        Ok(records)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all().context("failed to sync WAL on close")?;
        }
        Ok(())
    }
}

/// In-memory WAL. Clones share the same record list, so a test can keep a
/// handle while the processor owns another.
#[derive(Clone, Default)]
pub struct MemWal {
    records: Arc<Mutex<Vec<WalRecord>>>,
}

impl MemWal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<WalRecord> {
        self.records.lock().expect("WAL poisoned").clone()
    }
}

impl WriteAheadLog for MemWal {
    fn is_empty(&self) -> Result<bool> {
        Ok(self.records.lock().expect("WAL poisoned").is_empty())
    }

    fn append(&mut self, records: &[WalRecord]) -> Result<()> {
        self.records
            .lock()
            .expect("WAL poisoned")
            .extend_from_slice(records);
        Ok(())
    }

    fn load(&self) -> Result<Vec<WalRecord>> {
        Ok(self.records())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Folds WAL records into the state an engine restarts from.
///
/// The first record must be the bootstrap record. A later entry at an index
/// that already exists truncates the log from that index, mirroring how the
/// engine overwrites uncommitted suffixes.
pub fn recover(records: Vec<WalRecord>) -> Result<RecoveredLog> {
    let mut records = records.into_iter();
    let Some(WalRecord::Bootstrap {
        state,
        checkpoint_value,
    }) = records.next()
    else {
        bail!("WAL does not start with a bootstrap record");
    };

    let mut recovered = RecoveredLog {
        initial_state: state,
        initial_checkpoint: checkpoint_value,
        hard_state: HardStateRecord::default(),
        entries: Vec::new(),
        last_checkpoint: None,
    };

    for record in records {
        match record {
            WalRecord::Bootstrap { .. } => bail!("duplicate bootstrap record in WAL"),
            WalRecord::HardState { term, vote, commit } => {
                recovered.hard_state = HardStateRecord { term, vote, commit };
            }
            WalRecord::Entry {
                index,
                term,
                normal,
                data,
            } => {
                let first = recovered.entries.first().map(|entry| entry.index).unwrap_or(index);
                if index < first {
                    bail!("WAL entry {index} precedes first entry {first}");
                }
                let position = (index - first) as usize;
                if position > recovered.entries.len() {
                    bail!("gap in WAL before entry {index}");
                }
                recovered.entries.truncate(position);
                recovered.entries.push(EntryRecord {
                    index,
                    term,
                    normal,
                    data,
                });
            }
            WalRecord::Checkpoint { seq, value } => {
                recovered.last_checkpoint = Some(Checkpoint { seq, value });
            }
        }
    }

    Ok(recovered)
}
