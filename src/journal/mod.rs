//! Durable journal + snapshot persistence shared by the client-side stores
//! (outbox, replica) and the server-side state ledger.
//!
//! Each store keeps its full working set in memory, appends every mutation to
//! a JSON-lines journal, and periodically folds the journal into a MessagePack
//! snapshot written via temp-file + atomic rename. Recovery loads the snapshot
//! and replays journal records with a sequence number greater than the
//! snapshot's.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::core::{Result, SyncError};

pub const JOURNAL_FORMAT_VERSION: u16 = 1;

/// Durability mode for journal appends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DurabilityMode {
    /// Every append is fsynced before the mutation returns.
    Strict,
    /// Appends are flushed to the OS immediately and fsynced at most once
    /// per `sync_interval_ms`.
    Eventual { sync_interval_ms: u64 },
}

impl Default for DurabilityMode {
    fn default() -> Self {
        Self::Strict
    }
}

/// Controls when a store folds its journal into a fresh snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPolicy {
    /// Write a snapshot (and compact the journal) after this many journaled
    /// mutations.
    pub snapshot_every_ops: usize,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            snapshot_every_ops: 128,
        }
    }
}

/// A single record in a store's append-only journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord<O> {
    /// Monotonically increasing sequence number.
    pub seq: u64,
    pub ts_unix_ms: i64,
    pub op: O,
}

/// Append-only JSON-lines journal with configurable fsync behavior.
pub struct Journal {
    path: PathBuf,
    durability: DurabilityMode,
    last_sync_unix_ms: i64,
}

impl Journal {
    pub fn new(path: PathBuf, durability: DurabilityMode) -> Self {
        Self {
            path,
            durability,
            last_sync_unix_ms: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record and makes it durable per the configured mode
    /// before returning.
    pub async fn append<O: Serialize>(&mut self, record: &JournalRecord<O>) -> Result<()> {
        let line = serde_json::to_string(record)
            .map_err(|err| SyncError::Serde(format!("serialize journal record: {}", err)))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|err| SyncError::Io(err.to_string()))?;

        let mut journal_line = line;
        journal_line.push('\n');
        file.write_all(journal_line.as_bytes())
            .await
            .map_err(|err| SyncError::Io(err.to_string()))?;
        file.flush()
            .await
            .map_err(|err| SyncError::Io(err.to_string()))?;

        let now_ms = Utc::now().timestamp_millis();
        match self.durability {
            DurabilityMode::Strict => {
                file.sync_data()
                    .await
                    .map_err(|err| SyncError::Io(err.to_string()))?;
                self.last_sync_unix_ms = now_ms;
            }
            DurabilityMode::Eventual { sync_interval_ms } => {
                if now_ms - self.last_sync_unix_ms >= sync_interval_ms as i64 {
                    file.sync_data()
                        .await
                        .map_err(|err| SyncError::Io(err.to_string()))?;
                    self.last_sync_unix_ms = now_ms;
                }
            }
        }

        Ok(())
    }

    /// Reads every record with `seq > after_seq`, in file order.
    pub async fn read_after<O: DeserializeOwned>(
        &self,
        after_seq: u64,
    ) -> Result<Vec<JournalRecord<O>>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = OpenOptions::new()
            .read(true)
            .open(&self.path)
            .await
            .map_err(|err| SyncError::Io(err.to_string()))?;
        let mut reader = BufReader::new(file).lines();
        let mut records = Vec::new();

        while let Some(line) = reader
            .next_line()
            .await
            .map_err(|err| SyncError::Io(err.to_string()))?
        {
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str::<JournalRecord<O>>(&line)
                .map_err(|err| SyncError::Serde(format!("parse journal record: {}", err)))?;
            if record.seq > after_seq {
                records.push(record);
            }
        }

        Ok(records)
    }

    /// Drops every record with `seq <= keep_after_seq` by rewriting the
    /// journal through a temp file and an atomic rename. Called after a
    /// snapshot subsumes the prefix.
    pub async fn compact<O: Serialize + DeserializeOwned>(
        &self,
        keep_after_seq: u64,
    ) -> Result<()> {
        let retained = self.read_after::<O>(keep_after_seq).await?;

        let tmp_path = self.path.with_extension("tmp");
        let mut tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .await
            .map_err(|err| SyncError::Io(err.to_string()))?;

        for record in retained {
            let line = serde_json::to_string(&record)
                .map_err(|err| SyncError::Serde(format!("serialize journal record: {}", err)))?;
            tmp.write_all(line.as_bytes())
                .await
                .map_err(|err| SyncError::Io(err.to_string()))?;
            tmp.write_all(b"\n")
                .await
                .map_err(|err| SyncError::Io(err.to_string()))?;
        }

        tmp.flush()
            .await
            .map_err(|err| SyncError::Io(err.to_string()))?;

        fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|err| SyncError::Io(err.to_string()))?;
        Ok(())
    }
}

/// Writes a snapshot as MessagePack to a temp file and atomically renames it
/// into place, so a crash mid-write never leaves a torn snapshot.
pub async fn write_snapshot<T: Serialize>(path: &Path, snapshot: &T) -> Result<()> {
    let tmp_path = path.with_extension("tmp");

    let bytes = rmp_serde::to_vec_named(snapshot)
        .map_err(|err| SyncError::Serde(format!("serialize snapshot: {}", err)))?;

    fs::write(&tmp_path, bytes)
        .await
        .map_err(|err| SyncError::Io(err.to_string()))?;

    fs::rename(&tmp_path, path)
        .await
        .map_err(|err| SyncError::Io(err.to_string()))?;

    Ok(())
}

/// Reads a MessagePack snapshot, returning `None` if none exists yet.
pub async fn read_snapshot<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }

    let bytes = fs::read(path)
        .await
        .map_err(|err| SyncError::Io(err.to_string()))?;

    let snapshot = rmp_serde::from_slice::<T>(&bytes)
        .map_err(|err| SyncError::Serde(format!("parse snapshot: {}", err)))?;

    Ok(Some(snapshot))
}
