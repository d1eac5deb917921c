//! Local durable command queue (the outbox).
//!
//! Every envelope created while the client is offline lands here and survives
//! process restarts. The sync engine owns all delivery-state transitions;
//! callers only enqueue, discard, or explicitly retry.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, broadcast};
use uuid::Uuid;

use crate::core::{CommandEnvelope, DeliveryState, ErrorInfo, Result, SyncError};
use crate::journal::{
    DurabilityMode, JOURNAL_FORMAT_VERSION, Journal, JournalRecord, SnapshotPolicy, read_snapshot,
    write_snapshot,
};

const OUTBOX_SNAPSHOT_FILE: &str = "outbox_snapshot.bin";
const OUTBOX_JOURNAL_FILE: &str = "outbox_journal.log";

/// Operational policy for the outbox store.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OutboxPolicy {
    pub durability: DurabilityMode,
    pub snapshot: SnapshotPolicy,
}

/// Notification emitted on commit of every queue mutation. Delivery to
/// subscribers is asynchronous with respect to the mutation itself.
#[derive(Debug, Clone)]
pub enum OutboxEvent {
    Enqueued { command_id: Uuid },
    Inflight { command_id: Uuid },
    Failed { command_id: Uuid, error: ErrorInfo },
    Acknowledged { command_id: Uuid },
    Retried { command_id: Uuid },
    Discarded { command_id: Uuid },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum OutboxJournalOp {
    Upsert { envelope: CommandEnvelope },
    Remove { command_id: Uuid },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OutboxSnapshotFile {
    format_version: u16,
    created_at_unix_ms: i64,
    last_seq: u64,
    envelopes: Vec<CommandEnvelope>,
}

struct OutboxInner {
    root_dir: PathBuf,
    policy: OutboxPolicy,
    envelopes: HashMap<Uuid, CommandEnvelope>,
    journal: Journal,
    seq_next: u64,
    ops_since_snapshot: usize,
}

/// Durable FIFO queue of command envelopes with an explicit open/close
/// lifecycle and a broadcast stream of state transitions.
pub struct DurableOutbox {
    inner: Mutex<OutboxInner>,
    events: broadcast::Sender<OutboxEvent>,
}

impl DurableOutbox {
    /// Opens (or creates) the outbox under `dir`, replaying snapshot and
    /// journal. Envelopes found `Inflight` are ambiguous (the dispatch may or
    /// may not have reached the server before the crash) and revert to
    /// `Pending`; retrying them is safe because execution is idempotent
    /// server-side.
    pub async fn open(dir: impl AsRef<Path>, policy: OutboxPolicy) -> Result<Self> {
        let root_dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root_dir)
            .await
            .map_err(|err| SyncError::Io(err.to_string()))?;

        let journal = Journal::new(
            root_dir.join(OUTBOX_JOURNAL_FILE),
            policy.durability.clone(),
        );
        let mut inner = OutboxInner {
            root_dir,
            policy,
            envelopes: HashMap::new(),
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

    /// Subscribes to queue state transitions (drives reactive UI).
    pub fn subscribe(&self) -> broadcast::Receiver<OutboxEvent> {
        self.events.subscribe()
    }

    /// Appends a new envelope. Exactly one envelope may exist per
    /// `command_id`; a duplicate is a programmer error, not a retry.
    pub async fn enqueue(&self, envelope: CommandEnvelope) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.envelopes.contains_key(&envelope.command_id) {
            return Err(SyncError::DuplicateCommand(envelope.command_id));
        }
        let command_id = envelope.command_id;
        inner.journal_upsert(envelope).await?;
        drop(inner);
        let _ = self.events.send(OutboxEvent::Enqueued { command_id });
        Ok(())
    }

    /// Envelopes awaiting delivery (`Pending` or `Failed`), oldest first by
    /// `created_at` with `command_id` as tiebreak. Each call re-reads current
    /// state, so a drain interrupted mid-way restarts cleanly.
    pub async fn list_pending(&self) -> Vec<CommandEnvelope> {
        let inner = self.inner.lock().await;
        let mut pending: Vec<CommandEnvelope> = inner
            .envelopes
            .values()
            .filter(|e| {
                matches!(
                    e.delivery_state,
                    DeliveryState::Pending | DeliveryState::Failed
                )
            })
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.command_id.cmp(&b.command_id))
        });
        pending
    }

    pub async fn get(&self, command_id: Uuid) -> Option<CommandEnvelope> {
        self.inner.lock().await.envelopes.get(&command_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.envelopes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Marks an envelope as handed to the transport.
    pub async fn mark_inflight(&self, command_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mut envelope = inner.expect_envelope(command_id)?;
        if envelope.delivery_state == DeliveryState::Inflight {
            return Err(SyncError::Execution(format!(
                "command '{}' is already inflight",
                command_id
            )));
        }
        envelope.delivery_state = DeliveryState::Inflight;
        envelope.last_attempt_at = Some(Utc::now());
        inner.journal_upsert(envelope).await?;
        drop(inner);
        let _ = self.events.send(OutboxEvent::Inflight { command_id });
        Ok(())
    }

    /// Removes an envelope after the server acknowledged it. Deletion is the
    /// only way an envelope leaves the queue besides an explicit discard.
    pub async fn mark_acknowledged(&self, command_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.expect_envelope(command_id)?;
        inner.journal_remove(command_id).await?;
        drop(inner);
        let _ = self.events.send(OutboxEvent::Acknowledged { command_id });
        Ok(())
    }

    /// Records a failed delivery attempt: bumps `attempt_count`, stores the
    /// classified error, and reverts the envelope to `Failed`.
    pub async fn mark_failed(&self, command_id: Uuid, error: &SyncError) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mut envelope = inner.expect_envelope(command_id)?;
        let info = ErrorInfo::from_error(error);
        envelope.delivery_state = DeliveryState::Failed;
        envelope.attempt_count = envelope.attempt_count.saturating_add(1);
        envelope.last_error = Some(info.clone());
        envelope.last_attempt_at = Some(Utc::now());
        inner.journal_upsert(envelope).await?;
        drop(inner);
        let _ = self.events.send(OutboxEvent::Failed {
            command_id,
            error: info,
        });
        Ok(())
    }

    /// Explicit user retry of a `Failed` envelope: resets the attempt
    /// bookkeeping and returns it to `Pending`.
    pub async fn retry(&self, command_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mut envelope = inner.expect_envelope(command_id)?;
        if envelope.delivery_state != DeliveryState::Failed {
            return Err(SyncError::Execution(format!(
                "command '{}' is not in a failed state",
                command_id
            )));
        }
        envelope.delivery_state = DeliveryState::Pending;
        envelope.attempt_count = 0;
        envelope.last_error = None;
        envelope.last_attempt_at = None;
        inner.journal_upsert(envelope).await?;
        drop(inner);
        let _ = self.events.send(OutboxEvent::Retried { command_id });
        Ok(())
    }

    /// Deletes an envelope that has not been handed to the transport. An
    /// `Inflight` envelope may already be committed server-side, so it can
    /// never be discarded.
    pub async fn discard(&self, command_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let envelope = inner.expect_envelope(command_id)?;
        if envelope.delivery_state == DeliveryState::Inflight {
            return Err(SyncError::Execution(format!(
                "command '{}' is inflight and cannot be discarded",
                command_id
            )));
        }
        inner.journal_remove(command_id).await?;
        drop(inner);
        let _ = self.events.send(OutboxEvent::Discarded { command_id });
        Ok(())
    }

    /// Flushes a final snapshot and compacts the journal.
    pub async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.write_snapshot_and_compact().await
    }
}

impl OutboxInner {
    fn snapshot_path(&self) -> PathBuf {
        self.root_dir.join(OUTBOX_SNAPSHOT_FILE)
    }

    fn expect_envelope(&self, command_id: Uuid) -> Result<CommandEnvelope> {
        self.envelopes
            .get(&command_id)
            .cloned()
            .ok_or_else(|| SyncError::Execution(format!("unknown command '{}'", command_id)))
    }

    async fn load_from_disk(&mut self) -> Result<()> {
        let mut last_seq = 0u64;

        if let Some(snapshot) = read_snapshot::<OutboxSnapshotFile>(&self.snapshot_path()).await? {
            if snapshot.format_version != JOURNAL_FORMAT_VERSION {
                return Err(SyncError::Execution(format!(
                    "unsupported outbox snapshot format version {}",
                    snapshot.format_version
                )));
            }
            for envelope in snapshot.envelopes {
                self.envelopes.insert(envelope.command_id, envelope);
            }
            last_seq = snapshot.last_seq;
        }

        let records = self.journal.read_after::<OutboxJournalOp>(last_seq).await?;
        let mut max_seq = last_seq;
        for record in records {
            max_seq = max_seq.max(record.seq);
            match record.op {
                OutboxJournalOp::Upsert { envelope } => {
                    self.envelopes.insert(envelope.command_id, envelope);
                }
                OutboxJournalOp::Remove { command_id } => {
                    self.envelopes.remove(&command_id);
                }
            }
        }

        // A dispatch may or may not have reached the server before the
        // crash; idempotent execution makes the retry safe.
        for envelope in self.envelopes.values_mut() {
            if envelope.delivery_state == DeliveryState::Inflight {
                log::warn!(
                    "outbox recovery: command '{}' was inflight, reverting to pending",
                    envelope.command_id
                );
                envelope.delivery_state = DeliveryState::Pending;
            }
        }

        self.seq_next = max_seq.saturating_add(1).max(1);
        Ok(())
    }

    async fn journal_upsert(&mut self, envelope: CommandEnvelope) -> Result<()> {
        self.append_op(OutboxJournalOp::Upsert {
            envelope: envelope.clone(),
        })
        .await?;
        self.envelopes.insert(envelope.command_id, envelope);
        self.maybe_snapshot().await
    }

    async fn journal_remove(&mut self, command_id: Uuid) -> Result<()> {
        self.append_op(OutboxJournalOp::Remove { command_id }).await?;
        self.envelopes.remove(&command_id);
        self.maybe_snapshot().await
    }

    async fn append_op(&mut self, op: OutboxJournalOp) -> Result<()> {
        let seq = self.seq_next;
        self.seq_next = self.seq_next.saturating_add(1);
        self.journal
            .append(&JournalRecord {
                seq,
                ts_unix_ms: Utc::now().timestamp_millis(),
                op,
            })
            .await?;
        self.ops_since_snapshot = self.ops_since_snapshot.saturating_add(1);
        Ok(())
    }

    async fn maybe_snapshot(&mut self) -> Result<()> {
        if self.ops_since_snapshot < self.policy.snapshot.snapshot_every_ops {
            return Ok(());
        }
        self.write_snapshot_and_compact().await
    }

    async fn write_snapshot_and_compact(&mut self) -> Result<()> {
        let last_seq = self.seq_next.saturating_sub(1);
        let snapshot = OutboxSnapshotFile {
            format_version: JOURNAL_FORMAT_VERSION,
            created_at_unix_ms: Utc::now().timestamp_millis(),
            last_seq,
            envelopes: self.envelopes.values().cloned().collect(),
        };
        write_snapshot(&self.snapshot_path(), &snapshot).await?;
        self.journal.compact::<OutboxJournalOp>(last_seq).await?;
        self.ops_since_snapshot = 0;
        Ok(())
    }
}
