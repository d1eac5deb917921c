//! Generic workflow handlers for record modules.
//!
//! Every field-operations module (rfi, nc, wmc, ...) shares the same three
//! pipeline-level commands: `create`, `update`, and `transition`. The
//! per-module field schemas and business rules live outside the pipeline;
//! these handlers only enforce entity existence, shallow field merge, and
//! the module's status flow.

use serde::Deserialize;
use std::sync::Arc;

use crate::audit::AuditEventDraft;
use crate::core::{EntityRecord, Result, SyncError};
use crate::executor::StatusFlow;

use super::{CommandHandler, HandlerRegistry};

#[derive(Debug, Deserialize)]
struct CreatePayload {
    /// Client-minted id, so entities can be created offline.
    entity_id: String,
    #[serde(default)]
    fields: serde_json::Value,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdatePayload {
    entity_id: String,
    fields: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct TransitionPayload {
    entity_id: String,
    status: String,
}

/// Registers `create`, `update`, and `transition` for one module governed
/// by `flow`.
pub fn register_workflow(registry: &mut HandlerRegistry, module: &str, flow: StatusFlow) {
    let flow = Arc::new(flow);
    registry.register(module, "create", create_handler(flow.clone()));
    registry.register(module, "update", update_handler());
    registry.register(module, "transition", transition_handler(flow));
}

fn parse<T: serde::de::DeserializeOwned>(payload: &serde_json::Value) -> Result<T> {
    serde_json::from_value(payload.clone())
        .map_err(|err| SyncError::Validation(format!("malformed payload: {}", err)))
}

fn create_handler(flow: Arc<StatusFlow>) -> CommandHandler {
    Arc::new(move |ctx, txn| {
        let flow = flow.clone();
        Box::pin(async move {
            let payload: CreatePayload = parse(&ctx.payload)?;
            if payload.entity_id.trim().is_empty() {
                return Err(SyncError::Validation("entity_id must not be empty".into()));
            }
            if txn.get(&ctx.module, &payload.entity_id).await.is_some() {
                return Err(SyncError::Conflict(format!(
                    "entity '{}/{}' already exists",
                    ctx.module, payload.entity_id
                )));
            }

            let status = payload
                .status
                .unwrap_or_else(|| flow.initial_status().to_string());
            let fields = if payload.fields.is_null() {
                serde_json::json!({})
            } else {
                payload.fields
            };

            txn.stage(EntityRecord::new(
                ctx.module.clone(),
                payload.entity_id.clone(),
                status,
                fields,
            ));
            txn.push_audit(AuditEventDraft::new(
                ctx.module.clone(),
                payload.entity_id,
                "created",
            ));
            Ok(())
        })
    })
}

fn update_handler() -> CommandHandler {
    Arc::new(move |ctx, txn| {
        Box::pin(async move {
            let payload: UpdatePayload = parse(&ctx.payload)?;
            let Some(mut record) = txn.get(&ctx.module, &payload.entity_id).await else {
                return Err(SyncError::Validation(format!(
                    "entity '{}/{}' does not exist",
                    ctx.module, payload.entity_id
                )));
            };

            let prior = serde_json::to_value(&record)
                .map_err(|err| SyncError::Serde(format!("serialize prior state: {}", err)))?;

            // Shallow last-writer-wins merge of top-level fields.
            match (record.fields.as_object_mut(), payload.fields.as_object()) {
                (Some(existing), Some(incoming)) => {
                    for (key, value) in incoming {
                        existing.insert(key.clone(), value.clone());
                    }
                }
                _ => record.fields = payload.fields,
            }

            txn.push_audit(
                AuditEventDraft::new(ctx.module.clone(), payload.entity_id, "updated")
                    .with_prior_state(prior),
            );
            txn.stage(record);
            Ok(())
        })
    })
}

fn transition_handler(flow: Arc<StatusFlow>) -> CommandHandler {
    Arc::new(move |ctx, txn| {
        let flow = flow.clone();
        Box::pin(async move {
            let payload: TransitionPayload = parse(&ctx.payload)?;
            let Some(mut record) = txn.get(&ctx.module, &payload.entity_id).await else {
                return Err(SyncError::Validation(format!(
                    "entity '{}/{}' does not exist",
                    ctx.module, payload.entity_id
                )));
            };

            flow.ensure_transition(&record.status, &payload.status)?;

            let prior = serde_json::to_value(&record)
                .map_err(|err| SyncError::Serde(format!("serialize prior state: {}", err)))?;

            record.status = payload.status.clone();
            txn.push_audit(
                AuditEventDraft::new(ctx.module.clone(), payload.entity_id, payload.status)
                    .with_prior_state(prior),
            );
            txn.stage(record);
            Ok(())
        })
    })
}
