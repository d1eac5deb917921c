// ============================================================================
// Fieldsync Library
// ============================================================================
//
// Offline-first command synchronization pipeline: a client-side durable
// outbox and sync engine paired with server-side command dispatch,
// idempotent execution, and append-only audit logging.

pub mod audit;
pub mod core;
pub mod dispatch;
pub mod executor;
pub mod journal;
pub mod outbox;
pub mod replica;
pub mod server;
pub mod sync;

// Re-export main types for convenience
pub use audit::{AuditEventDraft, AuditLog, AuditRecord};
pub use core::{
    Actor, CommandEnvelope, CommandRequest, DeliveryState, EntityKey, EntityRecord, ErrorInfo,
    ErrorKind, Result, SyncError,
};
pub use dispatch::{
    CommandContext, CommandDispatcher, CommandHandler, HandlerRegistry, workflow::register_workflow,
};
pub use executor::{
    CommandOutcome, ExecutionReceipt, ExecutorPolicy, IdempotentExecutor, StateTransaction,
    StatusFlow, ledger::StateLedger,
};
pub use journal::{DurabilityMode, SnapshotPolicy};
pub use outbox::{DurableOutbox, OutboxEvent, OutboxPolicy};
pub use replica::{ReplicaEvent, ReplicaPolicy, ReplicaRecord, ReplicaStore};
pub use server::{ServerState, build_router};
pub use sync::transport::{
    CommandTransport, DispatchResponse, ErrorBody, HttpTransport, InMemoryTransport,
};
pub use sync::worker::{SyncWorker, spawn_sync_worker};
pub use sync::{DrainReport, RetryPolicy, SyncEngine, SyncEngineConfig, SyncStats};
