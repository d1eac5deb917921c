//! Network boundary between the sync engine and the command server.
//!
//! Implementations must classify failures before they reach the engine: the
//! retry/backoff decision in the drain loop depends entirely on the error
//! kind, so an unclassified error would either over-retry a rejection or
//! permanently fail a transient outage.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::audit::AuditRecord;
use crate::core::{CommandRequest, EntityRecord, Result, SyncError};
use crate::dispatch::CommandDispatcher;
use crate::executor::CommandOutcome;

/// Success body of a dispatched command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub entities: Vec<EntityRecord>,
    pub audit: Vec<AuditRecord>,
    pub replayed: bool,
}

impl From<CommandOutcome> for DispatchResponse {
    fn from(outcome: CommandOutcome) -> Self {
        Self {
            entities: outcome.entities,
            audit: outcome.audit,
            replayed: outcome.replayed,
        }
    }
}

/// Structured error body returned by the HTTP surface and parsed back by
/// `HttpTransport`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

#[async_trait]
pub trait CommandTransport: Send + Sync {
    /// Delivers one command and returns either the outcome or a classified
    /// error.
    async fn dispatch(&self, request: &CommandRequest) -> Result<DispatchResponse>;
}

/// Forwards commands straight into an in-process dispatcher. Used by tests
/// and embedded deployments where client and server share a process.
pub struct InMemoryTransport {
    dispatcher: Arc<CommandDispatcher>,
}

impl InMemoryTransport {
    pub fn new(dispatcher: Arc<CommandDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl CommandTransport for InMemoryTransport {
    async fn dispatch(&self, request: &CommandRequest) -> Result<DispatchResponse> {
        let outcome = self.dispatcher.dispatch(request.clone()).await?;
        Ok(outcome.into())
    }
}

/// Posts commands to a remote fieldsync server and maps HTTP failures back
/// onto the error taxonomy. Connection errors, timeouts, and 5xx responses
/// are transient; everything else is a definite rejection.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout_ms(base_url, 10_000)
    }

    pub fn with_timeout_ms(base_url: impl Into<String>, timeout_ms: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| SyncError::Execution(format!("build http client: {}", err)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl CommandTransport for HttpTransport {
    async fn dispatch(&self, request: &CommandRequest) -> Result<DispatchResponse> {
        let url = format!("{}/api/commands", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|err| SyncError::Transient(format!("dispatch '{}': {}", url, err)))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<DispatchResponse>()
                .await
                .map_err(|err| SyncError::Serde(format!("parse dispatch response: {}", err)));
        }

        if status.is_server_error() {
            let detail = response.text().await.unwrap_or_default();
            return Err(SyncError::Transient(format!(
                "server returned {}: {}",
                status, detail
            )));
        }

        let body = response.json::<ErrorBody>().await.unwrap_or(ErrorBody {
            error: format!("server returned {}", status),
            code: "unknown".to_string(),
        });

        Err(match body.code.as_str() {
            "validation" => SyncError::Validation(body.error),
            "authorization" => SyncError::Authorization(body.error),
            "conflict" => SyncError::Conflict(body.error),
            "unroutable" => SyncError::UnroutableCommand {
                module: request.module.clone(),
                command_type: request.command_type.clone(),
            },
            "duplicate_command" => SyncError::DuplicateCommand(request.command_id),
            _ => SyncError::Execution(body.error),
        })
    }
}
