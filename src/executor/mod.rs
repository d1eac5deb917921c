//! Idempotent command execution against the durable state ledger.
//!
//! `execute_once` is the core correctness mechanism of the pipeline: a
//! command identity is applied at most once, retransmissions replay the
//! recorded outcome, and the mutation plus its audit records commit
//! atomically or not at all.

pub mod ledger;
pub mod transitions;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, timeout};
use uuid::Uuid;

use crate::audit::{AuditEventDraft, AuditRecord};
use crate::core::{Actor, EntityKey, EntityRecord, Result, SyncError};
use crate::journal::{DurabilityMode, SnapshotPolicy};

use ledger::{CommitRequest, StateLedger};

pub use ledger::ExecutionReceipt;
pub use transitions::StatusFlow;

/// Operational policy for the executor and its ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorPolicy {
    pub durability: DurabilityMode,
    pub snapshot: SnapshotPolicy,
    /// Upper bound on handler execution; a timeout surfaces as a transient
    /// failure and commits nothing.
    pub handler_timeout_ms: u64,
}

impl Default for ExecutorPolicy {
    fn default() -> Self {
        Self {
            durability: DurabilityMode::default(),
            snapshot: SnapshotPolicy::default(),
            handler_timeout_ms: 10_000,
        }
    }
}

/// The result of one applied (or replayed) command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub command_id: Uuid,
    /// Entities as committed, with their post-commit versions.
    pub entities: Vec<EntityRecord>,
    pub audit: Vec<AuditRecord>,
    /// True when this outcome came from the idempotency ledger rather than
    /// a fresh execution.
    pub replayed: bool,
}

/// Staged reads and writes of one command execution.
///
/// Reads see committed state only; writes stay private to the transaction
/// until the executor commits. The versions observed by reads are
/// re-validated at commit, so two commands interleaving on the same entity
/// resolve to one winner and one conflict.
pub struct StateTransaction {
    ledger: Arc<StateLedger>,
    reads: HashMap<EntityKey, Option<u64>>,
    staged: Vec<EntityRecord>,
    audit_drafts: Vec<AuditEventDraft>,
}

impl StateTransaction {
    fn begin(ledger: Arc<StateLedger>) -> Self {
        Self {
            ledger,
            reads: HashMap::new(),
            staged: Vec::new(),
            audit_drafts: Vec::new(),
        }
    }

    /// Reads an entity: staged writes of this transaction first, then
    /// committed state. The first committed read of each key records the
    /// observed version for commit-time validation.
    pub async fn get(&mut self, entity: &str, entity_id: &str) -> Option<EntityRecord> {
        let key = EntityKey::new(entity, entity_id);
        if let Some(staged) = self.staged.iter().find(|record| record.key() == key) {
            return Some(staged.clone());
        }
        let committed = self.ledger.get_entity(&key).await;
        self.reads
            .entry(key)
            .or_insert(committed.as_ref().map(|record| record.version));
        committed
    }

    /// Stages an entity write. Staging a key that was never read asserts
    /// the entity is absent (a creation); anything else conflicts at
    /// commit.
    pub fn stage(&mut self, record: EntityRecord) {
        let key = record.key();
        if let Some(existing) = self.staged.iter_mut().find(|staged| staged.key() == key) {
            *existing = record;
        } else {
            self.staged.push(record);
        }
    }

    /// Stages an audit event; the executor seals it with the command id,
    /// actor, timestamp, and sequence at commit.
    pub fn push_audit(&mut self, draft: AuditEventDraft) {
        self.audit_drafts.push(draft);
    }
}

/// Executes mutations at most once per command identity.
pub struct IdempotentExecutor {
    ledger: Arc<StateLedger>,
    policy: ExecutorPolicy,
    /// Per-command guard: a second concurrent call with the same id waits
    /// for the first and then replays its receipt.
    inflight: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl IdempotentExecutor {
    pub fn new(ledger: Arc<StateLedger>, policy: ExecutorPolicy) -> Self {
        Self {
            ledger,
            policy,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn ledger(&self) -> Arc<StateLedger> {
        self.ledger.clone()
    }

    /// Runs `mutation` exactly once for `command_id`.
    ///
    /// A recorded receipt short-circuits to the previous outcome, marked
    /// `replayed`. Otherwise the mutation runs against a fresh transaction
    /// under the configured timeout, and its staged writes, audit events,
    /// and receipt commit atomically.
    pub async fn execute_once<F>(
        &self,
        command_id: Uuid,
        actor: &Actor,
        mutation: F,
    ) -> Result<CommandOutcome>
    where
        F: for<'a> FnOnce(&'a mut StateTransaction) -> BoxFuture<'a, Result<()>>,
    {
        if let Some(outcome) = self.replay(command_id).await {
            return Ok(outcome);
        }

        let guard = {
            let mut inflight = self.inflight.lock().await;
            inflight.entry(command_id).or_default().clone()
        };
        let held = guard.lock().await;

        // The first caller may have committed while we waited on the guard.
        if let Some(outcome) = self.replay(command_id).await {
            drop(held);
            self.release(command_id).await;
            return Ok(outcome);
        }

        let result = self.run_mutation(command_id, actor, mutation).await;
        drop(held);
        self.release(command_id).await;
        result
    }

    async fn run_mutation<F>(
        &self,
        command_id: Uuid,
        actor: &Actor,
        mutation: F,
    ) -> Result<CommandOutcome>
    where
        F: for<'a> FnOnce(&'a mut StateTransaction) -> BoxFuture<'a, Result<()>>,
    {
        let mut txn = StateTransaction::begin(self.ledger.clone());

        let bound = Duration::from_millis(self.policy.handler_timeout_ms);
        match timeout(bound, mutation(&mut txn)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(SyncError::Transient(format!(
                    "handler for command '{}' timed out after {}ms",
                    command_id, self.policy.handler_timeout_ms
                )));
            }
        }

        let outcome = self
            .ledger
            .commit(CommitRequest {
                command_id,
                actor_id: actor.actor_id.clone(),
                staged: txn.staged,
                read_versions: txn.reads,
                audit_drafts: txn.audit_drafts,
            })
            .await?;

        tracing::info!(
            command_id = %command_id,
            entities = outcome.entities.len(),
            audit = outcome.audit.len(),
            "command committed"
        );
        Ok(outcome)
    }

    async fn replay(&self, command_id: Uuid) -> Option<CommandOutcome> {
        let receipt = self.ledger.receipt(command_id).await?;
        tracing::debug!(command_id = %command_id, "replaying recorded outcome");
        let mut outcome = receipt.outcome;
        outcome.replayed = true;
        Some(outcome)
    }

    async fn release(&self, command_id: Uuid) {
        let mut inflight = self.inflight.lock().await;
        inflight.remove(&command_id);
    }
}
