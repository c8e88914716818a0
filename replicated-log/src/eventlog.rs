//! Optional recording of everything the driver feeds to and takes from the
//! engine.
//!
//! The log is a gzip stream of length-prefixed bincode [`EventRecord`]s, the
//! same framing the WAL uses. It is flushed after every drained round, so a
//! crashed node leaves a readable prefix behind; [`read_events`] stops
//! quietly at a torn tail.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::engine::{ActionBatch, Ingress, ResultBatch};

/// File name of the event log inside a node's run directory.
pub const EVENT_LOG_FILE: &str = "eventlog.gz";

/// One input to or output of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    Tick,
    Ingress(Ingress),
    Actions(ActionBatch),
    Results(ResultBatch),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Milliseconds since the log was created.
    pub at_ms: u64,
    pub event: Event,
}

/// Writer side of an event log.
pub struct EventLog {
    path: PathBuf,
    encoder: Option<GzEncoder<File>>,
    created: Instant,
    recorded: u64,
}

impl EventLog {
    /// Creates (or truncates) the log at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = File::create(&path)
            .with_context(|| format!("failed to create event log {}", path.display()))?;
        Ok(Self {
            path,
            encoder: Some(GzEncoder::new(file, Compression::default())),
            created: Instant::now(),
            recorded: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&mut self, event: Event) -> Result<()> {
        let Some(encoder) = self.encoder.as_mut() else {
            bail!("event log {} is closed", self.path.display());
        };
        let record = EventRecord {
            at_ms: u64::try_from(self.created.elapsed().as_millis()).unwrap_or(u64::MAX),
            event,
        };
        let bytes = bincode::serialize(&record).context("failed to encode event")?;
        let len = u32::try_from(bytes.len()).context("event too large")?;
        encoder
            .write_all(&len.to_be_bytes())
            .context("failed to write event log")?;
        encoder.write_all(&bytes).context("failed to write event log")?;
        self.recorded += 1;
        Ok(())
    }

    /// Pushes everything recorded so far through the compressor to disk.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(encoder) = self.encoder.as_mut() {
            encoder.flush().context("failed to flush event log")?;
        }
        Ok(())
    }

    /// Writes the gzip trailer and closes the file. Later calls are no-ops.
    pub fn finish(&mut self) -> Result<()> {
        if let Some(encoder) = self.encoder.take() {
            let file = encoder.finish().context("failed to finish event log")?;
            file.sync_all().context("failed to sync event log")?;
            debug!(path = %self.path.display(), events = self.recorded, "event log closed");
        }
        Ok(())
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            warn!(path = %self.path.display(), error = ?err, "event log not closed cleanly");
        }
    }
}

/// Reads back every complete record of an event log.
pub fn read_events(path: impl AsRef<Path>) -> Result<Vec<EventRecord>> {
    let path = path.as_ref();
    let file =
        File::open(path).with_context(|| format!("failed to open event log {}", path.display()))?;
    let mut decoder = GzDecoder::new(file);
    let mut bytes = Vec::new();
    if let Err(err) = decoder.read_to_end(&mut bytes) {
        // read_to_end keeps whatever was decoded before the error.
        if bytes.is_empty() {
            return Err(err).with_context(|| format!("failed to read event log {}", path.display()));
        }
        warn!(path = %path.display(), error = %err, "event log ends mid-stream");
    }

    let mut records = Vec::new();
    let mut offset = 0;
    while offset + 4 <= bytes.len() {
        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&bytes[offset..offset + 4]);
        let len = u32::from_be_bytes(len_buf) as usize;
        let start = offset + 4;
        if start + len > bytes.len() {
            break;
        }
        let record = bincode::deserialize(&bytes[start..start + len])
            .with_context(|| format!("corrupt event at offset {offset}"))?;
        records.push(record);
        offset = start + len;
    }
    if offset < bytes.len() {
        warn!(path = %path.display(), offset, "ignoring torn event record");
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Checkpoint, ClientRequest, Outbound};

    fn sample_events() -> Vec<Event> {
        vec![
            Event::Tick,
            Event::Ingress(Ingress::Propose(ClientRequest {
                client_id: 0,
                req_no: 3,
                data: b"payload".to_vec(),
            })),
            Event::Actions(ActionBatch {
                send: vec![Outbound {
                    to: 1,
                    payload: vec![9, 9],
                }],
                ..Default::default()
            }),
            Event::Results(ResultBatch {
                checkpoints: vec![Checkpoint {
                    seq: 4,
                    value: b"value".to_vec(),
                }],
                applied_through: Some(4),
                ..Default::default()
            }),
        ]
    }

    #[test]
    fn test_events_read_back_in_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(EVENT_LOG_FILE);
        let mut log = EventLog::create(&path)?;
        for event in sample_events() {
            log.record(event)?;
        }
        log.finish()?;
        assert!(log.record(Event::Tick).is_err());

        let records = read_events(&path)?;
        let events: Vec<Event> = records.iter().map(|record| record.event.clone()).collect();
        assert_eq!(events, sample_events());
        assert!(records.windows(2).all(|pair| pair[0].at_ms <= pair[1].at_ms));
        Ok(())
    }

    #[test]
    fn test_unfinished_log_keeps_flushed_prefix() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(EVENT_LOG_FILE);
        let mut log = EventLog::create(&path)?;
        for event in sample_events() {
            log.record(event)?;
        }
        log.flush()?;

        // What a crash right after the flush leaves on disk: no gzip trailer.
        let crashed = dir.path().join("crashed.gz");
        fs::copy(&path, &crashed)?;
        log.finish()?;

        let events: Vec<Event> = read_events(&crashed)?
            .into_iter()
            .map(|record| record.event)
            .collect();
        assert_eq!(events, sample_events());
        Ok(())
    }

    #[test]
    fn test_not_a_gzip_file_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(EVENT_LOG_FILE);
        fs::write(&path, b"plain text")?;
        assert!(read_events(&path).is_err());
        Ok(())
    }
}
