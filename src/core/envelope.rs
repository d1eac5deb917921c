use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::ErrorInfo;

/// Identity of the user who issued a command, attached at creation time and
/// never re-derived afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Actor {
    pub actor_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl Actor {
    pub fn new(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }
}

/// Delivery lifecycle of a queued envelope. Owned exclusively by the sync
/// engine; no other component transitions an envelope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Inflight,
    Acknowledged,
    Failed,
}

/// A command plus its identity and actor metadata: the unit of durability
/// and idempotency.
///
/// `command_id` is the sole idempotency key. Re-enqueuing the same logical
/// action must mint a new id, never reuse one, so the server can distinguish
/// a retransmission from a new user action with identical data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Globally unique, generated client-side at creation, immutable.
    pub command_id: Uuid,
    /// Routing target, e.g. module="rfi".
    pub module: String,
    /// Routing target, e.g. command_type="upsert".
    pub command_type: String,
    /// Opaque to the pipeline; interpreted only by the registered handler.
    pub payload: serde_json::Value,
    pub actor: Actor,
    /// Client-local timestamp. Used for queue ordering and audit display
    /// only, never for idempotency or authority.
    pub created_at: DateTime<Utc>,
    pub delivery_state: DeliveryState,
    pub attempt_count: u32,
    #[serde(default)]
    pub last_error: Option<ErrorInfo>,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl CommandEnvelope {
    /// Creates a new pending envelope with a fresh `command_id`.
    pub fn new(
        module: impl Into<String>,
        command_type: impl Into<String>,
        payload: serde_json::Value,
        actor: Actor,
    ) -> Self {
        Self {
            command_id: Uuid::new_v4(),
            module: module.into(),
            command_type: command_type.into(),
            payload,
            actor,
            created_at: Utc::now(),
            delivery_state: DeliveryState::Pending,
            attempt_count: 0,
            last_error: None,
            last_attempt_at: None,
        }
    }

    /// Overrides the creation timestamp (tests and imports).
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Replaces the actor, e.g. when a session identity is resolved after
    /// the envelope was built.
    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = actor;
        self
    }

    /// Projects the envelope onto the wire shape sent to the server. The
    /// delivery bookkeeping stays client-local.
    pub fn to_request(&self) -> CommandRequest {
        CommandRequest {
            command_id: self.command_id,
            module: self.module.clone(),
            command_type: self.command_type.clone(),
            payload: self.payload.clone(),
            actor: self.actor.clone(),
            created_at: self.created_at,
        }
    }
}

/// Wire shape of a command as dispatched to the server: the envelope minus
/// the client-side delivery bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command_id: Uuid,
    pub module: String,
    pub command_type: String,
    pub payload: serde_json::Value,
    pub actor: Actor,
    pub created_at: DateTime<Utc>,
}
