//! Client-side sync engine: drains the outbox against connectivity state,
//! applies acknowledgements to the replica, and schedules retries.

pub mod transport;
pub mod worker;

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use uuid::Uuid;

use crate::core::{CommandEnvelope, DeliveryState, ErrorKind, Result};
use crate::outbox::DurableOutbox;
use crate::replica::ReplicaStore;

use transport::{CommandTransport, DispatchResponse};

/// Retry behavior for transient delivery failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Automatic attempts before an envelope stays `Failed` awaiting an
    /// explicit user retry.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff: initial * 2^(attempts-1), capped.
    pub fn backoff_ms(&self, attempts: u32) -> u64 {
        let shift = attempts.saturating_sub(1).min(16);
        self.initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEngineConfig {
    pub retry: RetryPolicy,
    /// Periodic drain interval while online.
    pub drain_interval_ms: u64,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            drain_interval_ms: 5_000,
        }
    }
}

/// Engine counters, monotonically increasing over the engine's lifetime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStats {
    pub drains: u64,
    pub skipped_drains: u64,
    pub dispatched: u64,
    pub acknowledged: u64,
    pub rejected: u64,
    pub transient_failures: u64,
}

/// What one `drain_once` call did.
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    /// False when offline or when another drain was already running.
    pub ran: bool,
    pub dispatched: usize,
    pub acknowledged: usize,
    pub rejected: usize,
    /// Envelopes skipped this cycle: backoff window not elapsed, retry
    /// bound exhausted, or a definite rejection awaiting user action.
    pub deferred: usize,
    /// True when the drain stopped early on a transient failure.
    pub stopped_on_transient: bool,
}

/// Drains queued envelopes strictly in order over a classified transport.
///
/// Only one drain is ever active: a connectivity flap check-and-skips
/// instead of starting a second loop, so an envelope is never sent twice
/// concurrently.
pub struct SyncEngine {
    outbox: Arc<DurableOutbox>,
    replica: Arc<ReplicaStore>,
    transport: Arc<dyn CommandTransport>,
    config: SyncEngineConfig,
    online_tx: watch::Sender<bool>,
    drain_gate: Mutex<()>,
    stats: std::sync::Mutex<SyncStats>,
}

impl SyncEngine {
    /// Creates an engine that starts offline.
    pub fn new(
        outbox: Arc<DurableOutbox>,
        replica: Arc<ReplicaStore>,
        transport: Arc<dyn CommandTransport>,
        config: SyncEngineConfig,
    ) -> Self {
        let (online_tx, _) = watch::channel(false);
        Self {
            outbox,
            replica,
            transport,
            config,
            online_tx,
            drain_gate: Mutex::new(()),
            stats: std::sync::Mutex::new(SyncStats::default()),
        }
    }

    pub fn config(&self) -> &SyncEngineConfig {
        &self.config
    }

    pub fn outbox(&self) -> Arc<DurableOutbox> {
        self.outbox.clone()
    }

    pub fn replica(&self) -> Arc<ReplicaStore> {
        self.replica.clone()
    }

    /// Flips connectivity. The background worker drains immediately on an
    /// offline-to-online edge.
    pub fn set_online(&self, online: bool) {
        self.online_tx.send_replace(online);
    }

    pub fn is_online(&self) -> bool {
        *self.online_tx.borrow()
    }

    /// Watch channel for connectivity edges (consumed by the worker).
    pub fn subscribe_connectivity(&self) -> watch::Receiver<bool> {
        self.online_tx.subscribe()
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Runs one drain cycle: pulls the pending queue and dispatches each
    /// eligible envelope strictly in `created_at` order.
    ///
    /// A success applies the returned entities to the replica before the
    /// envelope is removed. A definite rejection marks the envelope failed
    /// and moves on, so later independent envelopes are still attempted. A
    /// transient failure marks the envelope failed and stops the cycle:
    /// connectivity is suspect, and dispatching later envelopes while an
    /// earlier one awaits retry would reorder the causal stream.
    pub async fn drain_once(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();

        if !self.is_online() {
            return Ok(report);
        }
        let Ok(_gate) = self.drain_gate.try_lock() else {
            self.with_stats(|stats| stats.skipped_drains += 1);
            return Ok(report);
        };
        report.ran = true;
        self.with_stats(|stats| stats.drains += 1);

        let pending = self.outbox.list_pending().await;
        tracing::debug!(pending = pending.len(), "drain cycle started");

        for envelope in pending {
            if !self.eligible(&envelope) {
                report.deferred += 1;
                continue;
            }

            let command_id = envelope.command_id;
            self.outbox.mark_inflight(command_id).await?;
            report.dispatched += 1;
            self.with_stats(|stats| stats.dispatched += 1);

            match self.transport.dispatch(&envelope.to_request()).await {
                Ok(response) => {
                    // The server committed. A local apply/ack failure must
                    // not leave the envelope inflight (unreachable by retry
                    // or discard); failing it keeps it actionable, and
                    // re-dispatch replays the receipt.
                    if let Err(err) = self.apply_acknowledgement(command_id, response).await {
                        tracing::warn!(command_id = %command_id, error = %err, "local apply failed after acknowledged dispatch");
                        self.outbox.mark_failed(command_id, &err).await?;
                        return Err(err);
                    }
                    report.acknowledged += 1;
                    self.with_stats(|stats| stats.acknowledged += 1);
                }
                Err(err) if err.kind() == ErrorKind::Transient => {
                    tracing::warn!(command_id = %command_id, error = %err, "transient delivery failure, stopping drain");
                    self.outbox.mark_failed(command_id, &err).await?;
                    report.stopped_on_transient = true;
                    self.with_stats(|stats| stats.transient_failures += 1);
                    break;
                }
                Err(err) => {
                    tracing::warn!(command_id = %command_id, error = %err, "command rejected");
                    self.outbox.mark_failed(command_id, &err).await?;
                    report.rejected += 1;
                    self.with_stats(|stats| stats.rejected += 1);
                }
            }
        }

        Ok(report)
    }

    /// Applies a successful dispatch locally: replica first, then removal
    /// from the queue.
    async fn apply_acknowledgement(
        &self,
        command_id: Uuid,
        response: DispatchResponse,
    ) -> Result<()> {
        self.replica.apply_entities(response.entities).await?;
        self.outbox.mark_acknowledged(command_id).await
    }

    /// Whether a queued envelope should be dispatched this cycle.
    fn eligible(&self, envelope: &CommandEnvelope) -> bool {
        if envelope.delivery_state != DeliveryState::Failed {
            return true;
        }
        let Some(error) = &envelope.last_error else {
            return true;
        };
        if error.kind.is_definite_rejection() {
            // Waits for an explicit user retry or discard.
            return false;
        }
        if envelope.attempt_count >= self.config.retry.max_attempts {
            return false;
        }
        let Some(last_attempt_at) = envelope.last_attempt_at else {
            return true;
        };
        let backoff = self.config.retry.backoff_ms(envelope.attempt_count);
        let ready_at = last_attempt_at + ChronoDuration::milliseconds(backoff as i64);
        Utc::now() >= ready_at
    }

    fn with_stats(&self, f: impl FnOnce(&mut SyncStats)) {
        // Counters stay usable even if a holder panicked mid-update.
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut stats);
    }
}
