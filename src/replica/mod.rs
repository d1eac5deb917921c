//! Local replica store: a reactive, eventually-consistent read model of the
//! server's durable entities.
//!
//! Consistency policy is fully pull-based: the replica changes only when the
//! sync engine applies entities returned by an acknowledged dispatch.
//! Provisional state before acknowledgement is visible through the outbox's
//! own event stream, never through the replica.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, broadcast};

use crate::core::{EntityRecord, Result, SyncError};
use crate::journal::{
    DurabilityMode, JOURNAL_FORMAT_VERSION, Journal, JournalRecord, SnapshotPolicy, read_snapshot,
    write_snapshot,
};

const REPLICA_SNAPSHOT_FILE: &str = "replica_snapshot.bin";
const REPLICA_JOURNAL_FILE: &str = "replica_journal.log";

/// Operational policy for the replica store.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplicaPolicy {
    pub durability: DurabilityMode,
    pub snapshot: SnapshotPolicy,
}

/// A replicated entity plus the time the replica last saw it from the
/// server. May be briefly stale between a local enqueue and its
/// acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicaRecord {
    pub entity: EntityRecord,
    pub synced_at: DateTime<Utc>,
}

/// Notification emitted on commit of every replica change.
#[derive(Debug, Clone)]
pub struct ReplicaEvent {
    pub collection: String,
    pub entity_id: String,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum ReplicaJournalOp {
    Apply { records: Vec<ReplicaRecord> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReplicaSnapshotFile {
    format_version: u16,
    created_at_unix_ms: i64,
    last_seq: u64,
    records: Vec<ReplicaRecord>,
    indexed_fields: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct IndexKey {
    collection: String,
    field: String,
    value: String,
}

struct ReplicaInner {
    root_dir: PathBuf,
    policy: ReplicaPolicy,
    collections: HashMap<String, BTreeMap<String, ReplicaRecord>>,
    indexed_fields: HashSet<(String, String)>,
    index_rows: HashMap<IndexKey, BTreeSet<String>>,
    journal: Journal,
    seq_next: u64,
    ops_since_snapshot: usize,
}

/// Durable reactive key-value store of replicated entities, one ordered map
/// per collection, with optional secondary indexes on top-level payload
/// fields.
pub struct ReplicaStore {
    inner: Mutex<ReplicaInner>,
    events: broadcast::Sender<ReplicaEvent>,
}

impl ReplicaStore {
    pub async fn open(dir: impl AsRef<Path>, policy: ReplicaPolicy) -> Result<Self> {
        let root_dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root_dir)
            .await
            .map_err(|err| SyncError::Io(err.to_string()))?;

        let journal = Journal::new(
            root_dir.join(REPLICA_JOURNAL_FILE),
            policy.durability.clone(),
        );
        let mut inner = ReplicaInner {
            root_dir,
            policy,
            collections: HashMap::new(),
            indexed_fields: HashSet::new(),
            index_rows: HashMap::new(),
            journal,
            seq_next: 1,
            ops_since_snapshot: 0,
        };
        inner.load_from_disk().await?;

        let (events, _) = broadcast::channel(256);
        Ok(Self {
            inner: Mutex::new(inner),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReplicaEvent> {
        self.events.subscribe()
    }

    /// Applies entities returned by an acknowledged dispatch. Journaled as
    /// one record, so a batch survives a crash whole or not at all.
    pub async fn apply_entities(&self, entities: Vec<EntityRecord>) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }
        let synced_at = Utc::now();
        let records: Vec<ReplicaRecord> = entities
            .into_iter()
            .map(|entity| ReplicaRecord { entity, synced_at })
            .collect();

        let mut inner = self.inner.lock().await;
        inner.journal_apply(records.clone()).await?;
        drop(inner);

        for record in records {
            let _ = self.events.send(ReplicaEvent {
                collection: record.entity.entity.clone(),
                entity_id: record.entity.entity_id.clone(),
                version: record.entity.version,
            });
        }
        Ok(())
    }

    /// Point lookup.
    pub async fn get(&self, collection: &str, entity_id: &str) -> Option<ReplicaRecord> {
        let inner = self.inner.lock().await;
        inner
            .collections
            .get(collection)
            .and_then(|records| records.get(entity_id))
            .cloned()
    }

    /// Every record in a collection, ordered by entity id.
    pub async fn list(&self, collection: &str) -> Vec<ReplicaRecord> {
        let inner = self.inner.lock().await;
        inner
            .collections
            .get(collection)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Registers a secondary index on a top-level payload field and
    /// backfills it from existing records.
    pub async fn register_index(&self, collection: &str, field: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner
            .indexed_fields
            .insert((collection.to_string(), field.to_string()))
        {
            return Ok(());
        }
        let rows: Vec<(IndexKey, String)> = inner
            .collections
            .get(collection)
            .map(|records| {
                records
                    .values()
                    .filter_map(|record| {
                        index_value(&record.entity, field).map(|value| {
                            (
                                IndexKey {
                                    collection: collection.to_string(),
                                    field: field.to_string(),
                                    value,
                                },
                                record.entity.entity_id.clone(),
                            )
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        for (key, entity_id) in rows {
            inner.index_rows.entry(key).or_default().insert(entity_id);
        }
        Ok(())
    }

    /// Indexed lookup by field value, ordered by entity id.
    pub async fn list_by_index(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<ReplicaRecord>> {
        let inner = self.inner.lock().await;
        if !inner
            .indexed_fields
            .contains(&(collection.to_string(), field.to_string()))
        {
            return Err(SyncError::Execution(format!(
                "no index registered on '{}.{}'",
                collection, field
            )));
        }
        let ids = inner
            .index_rows
            .get(&IndexKey {
                collection: collection.to_string(),
                field: field.to_string(),
                value: value.to_string(),
            })
            .cloned()
            .unwrap_or_default();
        let records = inner.collections.get(collection);
        Ok(ids
            .iter()
            .filter_map(|id| records.and_then(|map| map.get(id)).cloned())
            .collect())
    }

    /// Indexed lookup narrowed to one lifecycle status.
    pub async fn list_by_index_status(
        &self,
        collection: &str,
        field: &str,
        value: &str,
        status: &str,
    ) -> Result<Vec<ReplicaRecord>> {
        let records = self.list_by_index(collection, field, value).await?;
        Ok(records
            .into_iter()
            .filter(|record| record.entity.status == status)
            .collect())
    }

    pub async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.write_snapshot_and_compact().await
    }
}

/// Index values come from the entity's top-level payload fields; anything
/// non-scalar is not indexable.
fn index_value(entity: &EntityRecord, field: &str) -> Option<String> {
    match entity.fields.get(field) {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        Some(serde_json::Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    }
}

impl ReplicaInner {
    fn snapshot_path(&self) -> PathBuf {
        self.root_dir.join(REPLICA_SNAPSHOT_FILE)
    }

    async fn load_from_disk(&mut self) -> Result<()> {
        let mut last_seq = 0u64;

        if let Some(snapshot) = read_snapshot::<ReplicaSnapshotFile>(&self.snapshot_path()).await? {
            if snapshot.format_version != JOURNAL_FORMAT_VERSION {
                return Err(SyncError::Execution(format!(
                    "unsupported replica snapshot format version {}",
                    snapshot.format_version
                )));
            }
            self.indexed_fields = snapshot.indexed_fields.into_iter().collect();
            for record in snapshot.records {
                self.apply_to_memory(record);
            }
            last_seq = snapshot.last_seq;
        }

        let records = self
            .journal
            .read_after::<ReplicaJournalOp>(last_seq)
            .await?;
        let mut max_seq = last_seq;
        for record in records {
            max_seq = max_seq.max(record.seq);
            match record.op {
                ReplicaJournalOp::Apply { records } => {
                    for record in records {
                        self.apply_to_memory(record);
                    }
                }
            }
        }

        self.seq_next = max_seq.saturating_add(1).max(1);
        Ok(())
    }

    fn apply_to_memory(&mut self, record: ReplicaRecord) {
        let collection = record.entity.entity.clone();
        let entity_id = record.entity.entity_id.clone();

        let previous = self
            .collections
            .entry(collection.clone())
            .or_default()
            .insert(entity_id.clone(), record.clone());

        for (indexed_collection, field) in self.indexed_fields.clone() {
            if indexed_collection != collection {
                continue;
            }
            if let Some(old) = previous
                .as_ref()
                .and_then(|prev| index_value(&prev.entity, &field))
            {
                if let Some(ids) = self.index_rows.get_mut(&IndexKey {
                    collection: collection.clone(),
                    field: field.clone(),
                    value: old,
                }) {
                    ids.remove(&entity_id);
                }
            }
            if let Some(value) = index_value(&record.entity, &field) {
                self.index_rows
                    .entry(IndexKey {
                        collection: collection.clone(),
                        field,
                        value,
                    })
                    .or_default()
                    .insert(entity_id.clone());
            }
        }
    }

    async fn journal_apply(&mut self, records: Vec<ReplicaRecord>) -> Result<()> {
        let seq = self.seq_next;
        self.seq_next = self.seq_next.saturating_add(1);
        self.journal
            .append(&JournalRecord {
                seq,
                ts_unix_ms: Utc::now().timestamp_millis(),
                op: ReplicaJournalOp::Apply {
                    records: records.clone(),
                },
            })
            .await?;
        for record in records {
            self.apply_to_memory(record);
        }
        self.ops_since_snapshot = self.ops_since_snapshot.saturating_add(1);
        if self.ops_since_snapshot >= self.policy.snapshot.snapshot_every_ops {
            self.write_snapshot_and_compact().await?;
        }
        Ok(())
    }

    async fn write_snapshot_and_compact(&mut self) -> Result<()> {
        let last_seq = self.seq_next.saturating_sub(1);
        let snapshot = ReplicaSnapshotFile {
            format_version: JOURNAL_FORMAT_VERSION,
            created_at_unix_ms: Utc::now().timestamp_millis(),
            last_seq,
            records: self
                .collections
                .values()
                .flat_map(|records| records.values().cloned())
                .collect(),
            indexed_fields: self.indexed_fields.iter().cloned().collect(),
        };
        write_snapshot(&self.snapshot_path(), &snapshot).await?;
        self.journal.compact::<ReplicaJournalOp>(last_seq).await?;
        self.ops_since_snapshot = 0;
        Ok(())
    }
}
