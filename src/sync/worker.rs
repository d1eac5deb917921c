//! Background drain worker: ticks while online and reacts to connectivity
//! edges.

use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};

use crate::core::{Result, SyncError};

use super::SyncEngine;

/// Handle to the spawned drain loop.
pub struct SyncWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl SyncWorker {
    /// Signals the worker to stop and waits for it to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| SyncError::Execution(format!("sync worker join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for SyncWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Spawns the drain loop: drains periodically while online and immediately
/// on an offline-to-online edge. Drain errors are logged, never fatal to
/// the loop.
pub fn spawn_sync_worker(engine: Arc<SyncEngine>) -> SyncWorker {
    let interval_ms = engine.config().drain_interval_ms.max(10);
    let mut online_rx = engine.subscribe_connectivity();
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let join_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *online_rx.borrow() {
                        drain_and_log(&engine).await;
                    }
                }
                _ = sleep(Duration::from_millis(interval_ms)) => {
                    if engine.is_online() {
                        drain_and_log(&engine).await;
                    }
                }
            }
        }
    });

    SyncWorker {
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}

async fn drain_and_log(engine: &SyncEngine) {
    if let Err(err) = engine.drain_once().await {
        tracing::error!(error = %err, "drain cycle failed");
    }
}
