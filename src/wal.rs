//! Append-only JSON-lines event log.
//!
//! One record per line: wall-clock `ts` (float seconds), the node's Lamport
//! time, the event, and a CRC32 of the event body. Writes are flushed but not
//! fsynced, and the core never replays the file.

use crate::types::{Decision, Key, TxId, Value, Vote};
use anyhow::{anyhow, Context as _, Result};
use fs_err::{self as fs, File, OpenOptions};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, trace, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum WalEvent {
    /// Coordinator opened a 2PC round
    Start { tx: TxId, key: Key, value: Value },
    /// Participant answered a prepare
    PrepareVote {
        tx: TxId,
        key: Key,
        vote: Vote,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Coordinator decided a round
    Decision {
        tx: TxId,
        decision: Decision,
        votes: BTreeMap<String, Vote>,
    },
    Commit { tx: TxId, applied: bool },
    Abort {
        tx: TxId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalRecord {
    pub ts: f64,
    pub lamport: u64,
    #[serde(flatten)]
    pub event: WalEvent,
    pub crc: u32,
}

impl WalRecord {
    pub fn new(lamport: u64, event: WalEvent) -> Self {
        let crc = Self::checksum(&event);
        let ts = chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        Self {
            ts,
            lamport,
            event,
            crc,
        }
    }

    fn checksum(event: &WalEvent) -> u32 {
        let body = serde_json::to_vec(event).unwrap_or_default();
        crc32fast::hash(&body)
    }

    pub fn verify_checksum(&self) -> bool {
        Self::checksum(&self.event) == self.crc
    }
}

/// Per-node event log. A disabled log accepts and drops every record.
pub struct WriteAheadLog {
    file_path: Option<PathBuf>,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl WriteAheadLog {
    /// Open `file_path` for appending, creating it and its directory if needed
    pub fn new<P: AsRef<Path>>(file_path: P) -> Result<Self> {
        let file_path = file_path.as_ref().to_path_buf();
        if let Some(parent) = file_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file_path)?;
        info!("Opened event log: {:?}", file_path);

        Ok(Self {
            file_path: Some(file_path),
            writer: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    pub fn disabled() -> Self {
        Self {
            file_path: None,
            writer: Mutex::new(None),
        }
    }

    /// Append one event stamped with `lamport`
    pub fn append(&self, lamport: u64, event: WalEvent) -> Result<()> {
        let mut writer = self.writer.lock();
        let Some(writer) = writer.as_mut() else {
            return Ok(());
        };
        let record = WalRecord::new(lamport, event);
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        writer.write_all(&line)?;
        writer.flush()?;
        trace!("Wrote event log record: {record:?}");
        Ok(())
    }

    /// Best-effort append: a failure is logged and otherwise ignored
    pub fn record(&self, lamport: u64, event: WalEvent) {
        if let Err(e) = self.append(lamport, event) {
            warn!("Failed to append to event log {:?}: {e:#}", self.file_path);
        }
    }

    /// Read every intact record of a log file, for diagnostics.
    ///
    /// Unparseable or corrupted lines are skipped.
    pub fn read_all(file_path: impl AsRef<Path>) -> Result<Vec<WalRecord>> {
        let file_path = file_path.as_ref();
        let reader = BufReader::new(File::open(file_path)?);
        let mut records = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line.context("Failed to read event log line")?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WalRecord>(&line) {
                Ok(record) if record.verify_checksum() => records.push(record),
                Ok(_) => warn!("Corrupted event log record at line {}", lineno + 1),
                Err(e) => warn!("Unparseable event log line {}: {e}", lineno + 1),
            }
        }
        Ok(records)
    }

    /// Flush and stop writing; later appends are dropped
    pub fn close(&self) -> Result<()> {
        if let Some(mut writer) = self.writer.lock().take() {
            writer.flush()?;
            info!("Closed event log: {:?}", self.file_path);
        }
        Ok(())
    }

    pub fn path(&self) -> Result<&Path> {
        self.file_path
            .as_deref()
            .ok_or_else(|| anyhow!("Event log is disabled"))
    }

    pub fn is_enabled(&self) -> bool {
        self.file_path.is_some()
    }
}

impl Drop for WriteAheadLog {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Error closing event log in drop: {e}");
        }
    }
}
