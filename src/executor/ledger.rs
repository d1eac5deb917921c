//! Durable state boundary of the server: entities, audit records, and
//! execution receipts behind one atomic commit.
//!
//! A commit journals the entity mutations, the audit records, and the
//! receipt as a single record, then applies them to memory. Either all of
//! them become visible together or none do; there is no path that persists a
//! mutation without its audit trail.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::audit::{AuditEventDraft, AuditRecord};
use crate::core::{EntityKey, EntityRecord, Result, SyncError};
use crate::journal::{
    JOURNAL_FORMAT_VERSION, Journal, JournalRecord, read_snapshot, write_snapshot,
};

use super::{CommandOutcome, ExecutorPolicy};

const LEDGER_SNAPSHOT_FILE: &str = "ledger_snapshot.bin";
const LEDGER_JOURNAL_FILE: &str = "ledger_journal.log";

/// The recorded outcome of a command's first execution, replayed verbatim on
/// retransmission. Doubles as the idempotency ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReceipt {
    pub command_id: Uuid,
    pub outcome: CommandOutcome,
}

/// Everything one command stages for commit.
pub(crate) struct CommitRequest {
    pub command_id: Uuid,
    pub actor_id: String,
    pub staged: Vec<EntityRecord>,
    /// Entity versions observed by the transaction; `None` means the entity
    /// was absent when read (or never read, which expects a creation).
    pub read_versions: HashMap<EntityKey, Option<u64>>,
    pub audit_drafts: Vec<AuditEventDraft>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum LedgerJournalOp {
    Commit {
        entities: Vec<EntityRecord>,
        audit: Vec<AuditRecord>,
        receipt: ExecutionReceipt,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerSnapshotFile {
    format_version: u16,
    created_at_unix_ms: i64,
    last_seq: u64,
    entities: Vec<EntityRecord>,
    audit: Vec<AuditRecord>,
    receipts: Vec<ExecutionReceipt>,
    audit_seq_next: u64,
}

struct LedgerInner {
    root_dir: PathBuf,
    policy: ExecutorPolicy,
    entities: HashMap<EntityKey, EntityRecord>,
    audit: Vec<AuditRecord>,
    receipts: HashMap<Uuid, ExecutionReceipt>,
    audit_seq_next: u64,
    journal: Journal,
    seq_next: u64,
    ops_since_snapshot: usize,
}

/// Durable store of entities, audit records, and receipts. All writes pass
/// through `commit`; the brief inner lock is the only shared critical
/// section, so commands touching unrelated entities progress independently.
pub struct StateLedger {
    inner: Mutex<LedgerInner>,
}

impl StateLedger {
    pub async fn open(dir: impl AsRef<Path>, policy: ExecutorPolicy) -> Result<Self> {
        let root_dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root_dir)
            .await
            .map_err(|err| SyncError::Io(err.to_string()))?;

        let journal = Journal::new(
            root_dir.join(LEDGER_JOURNAL_FILE),
            policy.durability.clone(),
        );
        let mut inner = LedgerInner {
            root_dir,
            policy,
            entities: HashMap::new(),
            audit: Vec::new(),
            receipts: HashMap::new(),
            audit_seq_next: 1,
            journal,
            seq_next: 1,
            ops_since_snapshot: 0,
        };
        inner.load_from_disk().await?;

        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Committed view of one entity.
    pub async fn get_entity(&self, key: &EntityKey) -> Option<EntityRecord> {
        self.inner.lock().await.entities.get(key).cloned()
    }

    /// Every committed entity in a collection, ordered by entity id.
    pub async fn list_entities(&self, collection: &str) -> Vec<EntityRecord> {
        let inner = self.inner.lock().await;
        let mut records: Vec<EntityRecord> = inner
            .entities
            .values()
            .filter(|record| record.entity == collection)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        records
    }

    /// The idempotency lookup: the receipt of a previously executed command,
    /// if any.
    pub async fn receipt(&self, command_id: Uuid) -> Option<ExecutionReceipt> {
        self.inner.lock().await.receipts.get(&command_id).cloned()
    }

    pub async fn audit_by_entity(&self, entity_id: &str) -> Vec<AuditRecord> {
        let inner = self.inner.lock().await;
        let mut records: Vec<AuditRecord> = inner
            .audit
            .iter()
            .filter(|record| record.entity_id == entity_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.applied_at
                .cmp(&b.applied_at)
                .then_with(|| a.seq.cmp(&b.seq))
        });
        records
    }

    pub async fn audit_by_command(&self, command_id: Uuid) -> Vec<AuditRecord> {
        let inner = self.inner.lock().await;
        inner
            .audit
            .iter()
            .filter(|record| record.command_id == command_id)
            .cloned()
            .collect()
    }

    pub async fn audit_len(&self) -> usize {
        self.inner.lock().await.audit.len()
    }

    /// Atomically commits one command: validates the versions the
    /// transaction read are still current, bumps versions on staged
    /// entities, seals the audit drafts into records, journals everything as
    /// one record, and only then applies it to memory.
    pub(crate) async fn commit(&self, request: CommitRequest) -> Result<CommandOutcome> {
        let mut inner = self.inner.lock().await;

        if inner.receipts.contains_key(&request.command_id) {
            return Err(SyncError::Execution(format!(
                "receipt for command '{}' already recorded",
                request.command_id
            )));
        }

        // Per-entity optimistic validation: a concurrent command that
        // committed first surfaces here as a conflict, never as a blind
        // overwrite.
        for record in &request.staged {
            let key = record.key();
            let current = inner.entities.get(&key).map(|e| e.version);
            let expected = request.read_versions.get(&key).copied().unwrap_or(None);
            if current != expected {
                return Err(SyncError::Conflict(format!(
                    "entity '{}/{}' changed concurrently",
                    key.entity, key.entity_id
                )));
            }
        }

        let applied_at = Utc::now();
        let mut entities = Vec::with_capacity(request.staged.len());
        for mut record in request.staged {
            let key = record.key();
            record.version = inner
                .entities
                .get(&key)
                .map(|e| e.version)
                .unwrap_or(0)
                .saturating_add(1);
            record.updated_at = applied_at;
            entities.push(record);
        }

        let mut audit = Vec::with_capacity(request.audit_drafts.len());
        let mut audit_seq = inner.audit_seq_next;
        for draft in request.audit_drafts {
            audit.push(AuditRecord {
                command_id: request.command_id,
                entity: draft.entity,
                entity_id: draft.entity_id,
                event: draft.event,
                actor_id: request.actor_id.clone(),
                applied_at,
                seq: audit_seq,
                prior_state: draft.prior_state,
            });
            audit_seq = audit_seq.saturating_add(1);
        }

        let outcome = CommandOutcome {
            command_id: request.command_id,
            entities: entities.clone(),
            audit: audit.clone(),
            replayed: false,
        };
        let receipt = ExecutionReceipt {
            command_id: request.command_id,
            outcome: outcome.clone(),
        };

        // The journal append is the commit point: if it fails, memory is
        // untouched and nothing becomes visible.
        let seq = inner.seq_next;
        let record = JournalRecord {
            seq,
            ts_unix_ms: applied_at.timestamp_millis(),
            op: LedgerJournalOp::Commit {
                entities: entities.clone(),
                audit: audit.clone(),
                receipt: receipt.clone(),
            },
        };
        inner.journal.append(&record).await?;
        inner.seq_next = seq.saturating_add(1);

        for entity in entities {
            inner.entities.insert(entity.key(), entity);
        }
        inner.audit.extend(audit);
        inner.audit_seq_next = audit_seq;
        inner.receipts.insert(request.command_id, receipt);

        inner.ops_since_snapshot = inner.ops_since_snapshot.saturating_add(1);
        if inner.ops_since_snapshot >= inner.policy.snapshot.snapshot_every_ops {
            inner.write_snapshot_and_compact().await?;
        }

        Ok(outcome)
    }

    pub async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.write_snapshot_and_compact().await
    }
}

impl LedgerInner {
    fn snapshot_path(&self) -> PathBuf {
        self.root_dir.join(LEDGER_SNAPSHOT_FILE)
    }

    async fn load_from_disk(&mut self) -> Result<()> {
        let mut last_seq = 0u64;

        if let Some(snapshot) = read_snapshot::<LedgerSnapshotFile>(&self.snapshot_path()).await? {
            if snapshot.format_version != JOURNAL_FORMAT_VERSION {
                return Err(SyncError::Execution(format!(
                    "unsupported ledger snapshot format version {}",
                    snapshot.format_version
                )));
            }
            for entity in snapshot.entities {
                self.entities.insert(entity.key(), entity);
            }
            self.audit = snapshot.audit;
            for receipt in snapshot.receipts {
                self.receipts.insert(receipt.command_id, receipt);
            }
            self.audit_seq_next = snapshot.audit_seq_next;
            last_seq = snapshot.last_seq;
        }

        let records = self.journal.read_after::<LedgerJournalOp>(last_seq).await?;
        let mut max_seq = last_seq;
        for record in records {
            max_seq = max_seq.max(record.seq);
            match record.op {
                LedgerJournalOp::Commit {
                    entities,
                    audit,
                    receipt,
                } => {
                    for entity in entities {
                        self.entities.insert(entity.key(), entity);
                    }
                    for record in &audit {
                        self.audit_seq_next = self.audit_seq_next.max(record.seq.saturating_add(1));
                    }
                    self.audit.extend(audit);
                    self.receipts.insert(receipt.command_id, receipt);
                }
            }
        }

        self.seq_next = max_seq.saturating_add(1).max(1);
        Ok(())
    }

    async fn write_snapshot_and_compact(&mut self) -> Result<()> {
        let last_seq = self.seq_next.saturating_sub(1);
        let snapshot = LedgerSnapshotFile {
            format_version: JOURNAL_FORMAT_VERSION,
            created_at_unix_ms: Utc::now().timestamp_millis(),
            last_seq,
            entities: self.entities.values().cloned().collect(),
            audit: self.audit.clone(),
            receipts: self.receipts.values().cloned().collect(),
            audit_seq_next: self.audit_seq_next,
        };
        write_snapshot(&self.snapshot_path(), &snapshot).await?;
        self.journal.compact::<LedgerJournalOp>(last_seq).await?;
        self.ops_since_snapshot = 0;
        Ok(())
    }
}
