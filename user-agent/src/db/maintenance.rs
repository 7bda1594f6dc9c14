// src/db/maintenance.rs
//! Periodic WAL checkpoints.

use std::{path::PathBuf, time::Duration};

use log::Level;
use rusqlite::Connection;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{config::DatabaseConfig, warden_log};

/// Checkpoint and truncate the WAL every `checkpoint_seconds` until cancelled.
/// A zero period disables the task.
pub fn spawn_wal_maintenance(
    db_path: PathBuf,
    cfg: &DatabaseConfig,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    if cfg.checkpoint_seconds == 0 {
        return None;
    }
    let period = Duration::from_secs(cfg.checkpoint_seconds);
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => break,
            }
            let path = db_path.clone();
            let res = tokio::task::spawn_blocking(move || {
                Connection::open(&path)?.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
            })
            .await;
            match res {
                Ok(Ok(())) => warden_log!(Level::Debug, "ledger", "WAL checkpointed"),
                Ok(Err(e)) => warden_log!(Level::Warn, "ledger", "WAL checkpoint failed: {}", e),
                Err(e) => warden_log!(Level::Warn, "ledger", "WAL checkpoint task failed: {}", e),
            }
        }
    }))
}
