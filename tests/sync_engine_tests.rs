use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::{Arc, Mutex};
use tempfile::tempdir;
use uuid::Uuid;

use fieldsync::{
    Actor, CommandEnvelope, CommandRequest, CommandTransport, DeliveryState, DispatchResponse,
    DurableOutbox, EntityRecord, OutboxPolicy, ReplicaPolicy, ReplicaStore, Result, RetryPolicy,
    SyncEngine, SyncEngineConfig, SyncError, spawn_sync_worker,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Succeed,
    Transient,
    Conflict,
}

/// Transport double that records dispatch order and answers per the current
/// mode.
struct ScriptedTransport {
    mode: Mutex<Mode>,
    dispatched: Mutex<Vec<Uuid>>,
    entities: Mutex<Vec<EntityRecord>>,
}

impl ScriptedTransport {
    fn new(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            dispatched: Mutex::new(Vec::new()),
            entities: Mutex::new(Vec::new()),
        })
    }

    fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    fn respond_with(&self, entities: Vec<EntityRecord>) {
        *self.entities.lock().unwrap() = entities;
    }

    fn dispatched(&self) -> Vec<Uuid> {
        self.dispatched.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandTransport for ScriptedTransport {
    async fn dispatch(&self, request: &CommandRequest) -> Result<DispatchResponse> {
        self.dispatched.lock().unwrap().push(request.command_id);
        match *self.mode.lock().unwrap() {
            Mode::Succeed => Ok(DispatchResponse {
                entities: self.entities.lock().unwrap().clone(),
                audit: Vec::new(),
                replayed: false,
            }),
            Mode::Transient => Err(SyncError::Transient("connection refused".to_string())),
            Mode::Conflict => Err(SyncError::Conflict("state changed elsewhere".to_string())),
        }
    }
}

async fn engine_with(
    dir: &std::path::Path,
    transport: Arc<ScriptedTransport>,
    retry: RetryPolicy,
) -> Arc<SyncEngine> {
    let outbox = Arc::new(
        DurableOutbox::open(dir.join("outbox"), OutboxPolicy::default())
            .await
            .unwrap(),
    );
    let replica = Arc::new(
        ReplicaStore::open(dir.join("replica"), ReplicaPolicy::default())
            .await
            .unwrap(),
    );
    Arc::new(SyncEngine::new(
        outbox,
        replica,
        transport,
        SyncEngineConfig {
            retry,
            drain_interval_ms: 50,
        },
    ))
}

fn no_backoff() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff_ms: 0,
        max_backoff_ms: 0,
    }
}

fn envelope(seconds_ago: i64) -> CommandEnvelope {
    CommandEnvelope::new("rfi", "create", json!({"entity_id": "e1"}), Actor::new("u1"))
        .with_created_at(Utc::now() - ChronoDuration::seconds(seconds_ago))
}

#[tokio::test]
async fn drain_dispatches_in_enqueue_order() {
    let dir = tempdir().unwrap();
    let transport = ScriptedTransport::new(Mode::Succeed);
    let engine = engine_with(dir.path(), transport.clone(), no_backoff()).await;

    let mut expected = Vec::new();
    for seconds in (1..=5).rev() {
        let env = envelope(seconds);
        expected.push(env.command_id);
        engine.outbox().enqueue(env).await.unwrap();
    }

    engine.set_online(true);
    let report = engine.drain_once().await.unwrap();

    assert!(report.ran);
    assert_eq!(report.dispatched, 5);
    assert_eq!(report.acknowledged, 5);
    assert_eq!(transport.dispatched(), expected);
    assert!(engine.outbox().is_empty().await);
}

#[tokio::test]
async fn drain_skips_entirely_while_offline() {
    let dir = tempdir().unwrap();
    let transport = ScriptedTransport::new(Mode::Succeed);
    let engine = engine_with(dir.path(), transport.clone(), no_backoff()).await;

    engine.outbox().enqueue(envelope(1)).await.unwrap();
    let report = engine.drain_once().await.unwrap();

    assert!(!report.ran);
    assert!(transport.dispatched().is_empty());
    assert_eq!(engine.outbox().len().await, 1);
}

#[tokio::test]
async fn definite_rejection_does_not_block_later_envelopes() {
    let dir = tempdir().unwrap();
    let transport = ScriptedTransport::new(Mode::Conflict);
    let engine = engine_with(dir.path(), transport.clone(), no_backoff()).await;

    let first = envelope(3);
    let second = envelope(2);
    engine.outbox().enqueue(first.clone()).await.unwrap();
    engine.outbox().enqueue(second.clone()).await.unwrap();

    engine.set_online(true);
    let report = engine.drain_once().await.unwrap();

    // Both were attempted despite the first being rejected.
    assert_eq!(report.dispatched, 2);
    assert_eq!(report.rejected, 2);
    assert_eq!(
        transport.dispatched(),
        vec![first.command_id, second.command_id]
    );

    // Rejected envelopes wait for explicit user action, not auto-retry.
    let report = engine.drain_once().await.unwrap();
    assert_eq!(report.dispatched, 0);
    assert_eq!(report.deferred, 2);
}

#[tokio::test]
async fn transient_failure_stops_the_drain_cycle() {
    let dir = tempdir().unwrap();
    let transport = ScriptedTransport::new(Mode::Transient);
    let engine = engine_with(dir.path(), transport.clone(), no_backoff()).await;

    let first = envelope(3);
    let second = envelope(2);
    engine.outbox().enqueue(first.clone()).await.unwrap();
    engine.outbox().enqueue(second.clone()).await.unwrap();

    engine.set_online(true);
    let report = engine.drain_once().await.unwrap();

    assert!(report.stopped_on_transient);
    assert_eq!(transport.dispatched(), vec![first.command_id]);
    // The later envelope was never attempted; causal order is preserved.
    let second_stored = engine.outbox().get(second.command_id).await.unwrap();
    assert_eq!(second_stored.delivery_state, DeliveryState::Pending);
}

#[tokio::test]
async fn transient_failures_stop_after_the_retry_bound() {
    let dir = tempdir().unwrap();
    let transport = ScriptedTransport::new(Mode::Transient);
    let engine = engine_with(dir.path(), transport.clone(), no_backoff()).await;

    let env = envelope(1);
    engine.outbox().enqueue(env.clone()).await.unwrap();
    engine.set_online(true);

    // Drains past the bound must not dispatch again.
    for _ in 0..6 {
        engine.drain_once().await.unwrap();
    }

    assert_eq!(transport.dispatched().len(), 3);
    let stored = engine.outbox().get(env.command_id).await.unwrap();
    assert_eq!(stored.delivery_state, DeliveryState::Failed);
    assert_eq!(stored.attempt_count, 3);

    // Explicit user retry re-arms the envelope.
    engine.outbox().retry(env.command_id).await.unwrap();
    transport.set_mode(Mode::Succeed);
    let report = engine.drain_once().await.unwrap();
    assert_eq!(report.acknowledged, 1);
    assert!(engine.outbox().is_empty().await);
}

#[tokio::test]
async fn backoff_window_defers_failed_envelopes() {
    let dir = tempdir().unwrap();
    let transport = ScriptedTransport::new(Mode::Transient);
    let retry = RetryPolicy {
        max_attempts: 5,
        initial_backoff_ms: 60_000,
        max_backoff_ms: 60_000,
    };
    let engine = engine_with(dir.path(), transport.clone(), retry).await;

    let env = envelope(1);
    engine.outbox().enqueue(env).await.unwrap();
    engine.set_online(true);

    engine.drain_once().await.unwrap();
    let report = engine.drain_once().await.unwrap();

    // One attempt happened; the second drain deferred inside the window.
    assert_eq!(transport.dispatched().len(), 1);
    assert_eq!(report.deferred, 1);
}

#[tokio::test]
async fn engine_counters_accumulate() {
    let dir = tempdir().unwrap();
    let transport = ScriptedTransport::new(Mode::Succeed);
    let engine = engine_with(dir.path(), transport, no_backoff()).await;

    engine.outbox().enqueue(envelope(2)).await.unwrap();
    engine.outbox().enqueue(envelope(1)).await.unwrap();
    engine.set_online(true);
    engine.drain_once().await.unwrap();
    engine.drain_once().await.unwrap();

    let stats = engine.stats();
    assert_eq!(stats.drains, 2);
    assert_eq!(stats.dispatched, 2);
    assert_eq!(stats.acknowledged, 2);
    assert_eq!(stats.rejected, 0);
}

#[tokio::test]
async fn local_apply_failure_leaves_envelope_retryable() {
    let dir = tempdir().unwrap();
    let transport = ScriptedTransport::new(Mode::Succeed);
    transport.respond_with(vec![EntityRecord::new("rfi", "e1", "draft", json!({}))]);
    let engine = engine_with(dir.path(), transport.clone(), no_backoff()).await;

    let env = envelope(1);
    engine.outbox().enqueue(env.clone()).await.unwrap();
    engine.set_online(true);

    // Break the replica's backing directory so the returned entities cannot
    // be journaled locally.
    std::fs::remove_dir_all(dir.path().join("replica")).unwrap();

    let err = engine.drain_once().await.unwrap_err();
    assert!(matches!(err, SyncError::Io(_)));

    // The server committed but the local apply failed: the envelope must
    // not be stranded inflight. It stays failed, visible to later drains,
    // and explicit retry still works.
    let stored = engine.outbox().get(env.command_id).await.unwrap();
    assert_eq!(stored.delivery_state, DeliveryState::Failed);
    assert_eq!(engine.outbox().list_pending().await.len(), 1);
    engine.outbox().retry(env.command_id).await.unwrap();
}

#[tokio::test]
async fn background_worker_drains_on_edge_and_on_tick() {
    let dir = tempdir().unwrap();
    let transport = ScriptedTransport::new(Mode::Succeed);
    let engine = engine_with(dir.path(), transport.clone(), no_backoff()).await;

    engine.outbox().enqueue(envelope(2)).await.unwrap();
    let worker = spawn_sync_worker(engine.clone());

    // Going online drains immediately, without a manual drain_once.
    engine.set_online(true);
    wait_until_empty(&engine).await;
    assert_eq!(transport.dispatched().len(), 1);

    // Enqueued while already online: the periodic tick picks it up.
    engine.outbox().enqueue(envelope(1)).await.unwrap();
    wait_until_empty(&engine).await;
    assert_eq!(transport.dispatched().len(), 2);

    worker.stop().await.unwrap();
}

async fn wait_until_empty(engine: &SyncEngine) {
    let drained = async {
        while !engine.outbox().is_empty().await {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(std::time::Duration::from_secs(5), drained)
        .await
        .expect("worker never drained the queue");
}

#[tokio::test]
async fn backoff_grows_exponentially_and_caps() {
    let retry = RetryPolicy {
        max_attempts: 10,
        initial_backoff_ms: 100,
        max_backoff_ms: 1_000,
    };
    assert_eq!(retry.backoff_ms(1), 100);
    assert_eq!(retry.backoff_ms(2), 200);
    assert_eq!(retry.backoff_ms(3), 400);
    assert_eq!(retry.backoff_ms(4), 800);
    assert_eq!(retry.backoff_ms(5), 1_000);
    assert_eq!(retry.backoff_ms(60), 1_000);
}
