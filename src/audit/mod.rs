//! Append-only audit ledger types and the read-side query surface.
//!
//! Records are written exclusively inside the idempotent executor's commit;
//! there is no public write surface, and no update or delete surface at all.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::executor::ledger::StateLedger;

/// An immutable record of one applied state mutation, linked to the command
/// that caused it. Audit records and commands are independently lifecycled:
/// the envelope is deleted on acknowledgement, the audit record is retained
/// forever.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditRecord {
    /// Foreign reference to the causing command; not owned.
    pub command_id: Uuid,
    pub entity: String,
    pub entity_id: String,
    /// Event name such as `"created"` or `"approved"`.
    pub event: String,
    pub actor_id: String,
    /// Server-authoritative timestamp assigned at commit.
    pub applied_at: DateTime<Utc>,
    /// Ledger-assigned sequence number; total order across all records.
    pub seq: u64,
    /// Snapshot of the state prior to the mutation, for reversibility.
    #[serde(default)]
    pub prior_state: Option<serde_json::Value>,
}

/// An audit event staged by a handler, completed by the executor at commit
/// with the command id, actor, timestamp, and sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEventDraft {
    pub entity: String,
    pub entity_id: String,
    pub event: String,
    #[serde(default)]
    pub prior_state: Option<serde_json::Value>,
}

impl AuditEventDraft {
    pub fn new(
        entity: impl Into<String>,
        entity_id: impl Into<String>,
        event: impl Into<String>,
    ) -> Self {
        Self {
            entity: entity.into(),
            entity_id: entity_id.into(),
            event: event.into(),
            prior_state: None,
        }
    }

    pub fn with_prior_state(mut self, prior_state: serde_json::Value) -> Self {
        self.prior_state = Some(prior_state);
        self
    }
}

/// Read-only handle over the ledger's audit records, used for history and
/// audit-trail display.
pub struct AuditLog {
    ledger: Arc<StateLedger>,
}

impl AuditLog {
    pub fn new(ledger: Arc<StateLedger>) -> Self {
        Self { ledger }
    }

    /// Records touching one entity, ordered by `applied_at` ascending with
    /// `seq` as tiebreak.
    pub async fn list_by_entity(&self, entity_id: &str) -> Vec<AuditRecord> {
        self.ledger.audit_by_entity(entity_id).await
    }

    /// Records produced by one command.
    pub async fn list_by_command(&self, command_id: Uuid) -> Vec<AuditRecord> {
        self.ledger.audit_by_command(command_id).await
    }

    pub async fn len(&self) -> usize {
        self.ledger.audit_len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
