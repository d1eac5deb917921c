//! Server-side command routing.
//!
//! Routing is a plain table: `(module, command_type)` to handler, populated
//! at startup. The dispatcher validates the envelope shell, resolves exactly
//! one handler, and hands it to the idempotent executor so the handler's
//! mutation and the audit write run under the same idempotency guard.

pub mod workflow;

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{Actor, CommandRequest, Result, SyncError};
use crate::executor::{CommandOutcome, IdempotentExecutor, StateTransaction};

/// Handlers are functions keyed by the `(module, command_type)` tag, not
/// behavior-bearing objects. They stage entity writes and audit events on
/// the transaction; the executor commits both atomically.
pub type CommandHandler = Arc<
    dyn for<'a> Fn(CommandContext, &'a mut StateTransaction) -> BoxFuture<'a, Result<()>>
        + Send
        + Sync,
>;

/// Command metadata handed to a handler. The payload is opaque to the
/// pipeline; the handler interprets it.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub command_id: uuid::Uuid,
    pub module: String,
    pub command_type: String,
    pub payload: serde_json::Value,
    pub actor: Actor,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl CommandContext {
    fn from_request(request: &CommandRequest) -> Self {
        Self {
            command_id: request.command_id,
            module: request.module.clone(),
            command_type: request.command_type.clone(),
            payload: request.payload.clone(),
            actor: request.actor.clone(),
            created_at: request.created_at,
        }
    }
}

/// Explicit mapping from `(module, command_type)` to handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(String, String), CommandHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler; the last registration for a tag wins.
    pub fn register(
        &mut self,
        module: impl Into<String>,
        command_type: impl Into<String>,
        handler: CommandHandler,
    ) {
        self.handlers
            .insert((module.into(), command_type.into()), handler);
    }

    pub fn resolve(&self, module: &str, command_type: &str) -> Option<CommandHandler> {
        self.handlers
            .get(&(module.to_string(), command_type.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Stateless router in front of the idempotent executor.
pub struct CommandDispatcher {
    registry: HandlerRegistry,
    executor: Arc<IdempotentExecutor>,
    max_payload_bytes: usize,
}

impl CommandDispatcher {
    pub fn new(registry: HandlerRegistry, executor: Arc<IdempotentExecutor>) -> Self {
        Self {
            registry,
            executor,
            max_payload_bytes: 1024 * 1024,
        }
    }

    pub fn with_max_payload_bytes(mut self, max_payload_bytes: usize) -> Self {
        self.max_payload_bytes = max_payload_bytes;
        self
    }

    pub fn executor(&self) -> Arc<IdempotentExecutor> {
        self.executor.clone()
    }

    /// Validates the envelope shell, routes to exactly one handler, and
    /// executes it under the command's idempotency guard.
    pub async fn dispatch(&self, request: CommandRequest) -> Result<CommandOutcome> {
        self.validate(&request)?;

        let handler = self
            .registry
            .resolve(&request.module, &request.command_type)
            .ok_or_else(|| SyncError::UnroutableCommand {
                module: request.module.clone(),
                command_type: request.command_type.clone(),
            })?;

        tracing::debug!(
            command_id = %request.command_id,
            module = %request.module,
            command_type = %request.command_type,
            "routing command"
        );

        let ctx = CommandContext::from_request(&request);
        let actor = request.actor.clone();
        self.executor
            .execute_once(request.command_id, &actor, move |txn| handler(ctx, txn))
            .await
    }

    fn validate(&self, request: &CommandRequest) -> Result<()> {
        if request.module.trim().is_empty() || request.command_type.trim().is_empty() {
            return Err(SyncError::Validation(
                "module and command_type must not be empty".to_string(),
            ));
        }
        if request.actor.actor_id.trim().is_empty() {
            return Err(SyncError::Authorization(
                "command carries no actor identity".to_string(),
            ));
        }
        let payload_len = serde_json::to_vec(&request.payload)
            .map_err(|err| SyncError::Serde(format!("serialize payload: {}", err)))?
            .len();
        if payload_len > self.max_payload_bytes {
            return Err(SyncError::Validation(format!(
                "payload of {} bytes exceeds the {} byte limit",
                payload_len, self.max_payload_bytes
            )));
        }
        Ok(())
    }
}
