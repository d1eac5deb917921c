use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a durable state entity: its collection plus its id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub entity: String,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(entity: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            entity_id: entity_id.into(),
        }
    }
}

/// A durable domain record (RFI, NC, WMC, ...). Owned by the idempotent
/// executor and mutated only through successful command execution; the
/// pipeline never deletes one (soft lifecycle via `status`, e.g.
/// `"archived"`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityRecord {
    pub entity: String,
    pub entity_id: String,
    /// Current lifecycle status, validated against a `StatusFlow` on every
    /// transition command.
    pub status: String,
    /// Incremented once per applied command; the optimistic concurrency
    /// token checked at commit.
    pub version: u64,
    pub fields: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl EntityRecord {
    pub fn new(
        entity: impl Into<String>,
        entity_id: impl Into<String>,
        status: impl Into<String>,
        fields: serde_json::Value,
    ) -> Self {
        Self {
            entity: entity.into(),
            entity_id: entity_id.into(),
            status: status.into(),
            version: 0,
            fields,
            updated_at: Utc::now(),
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity.clone(), self.entity_id.clone())
    }
}
