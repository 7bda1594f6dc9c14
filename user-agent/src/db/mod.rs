// src/db/mod.rs
//! Public façade for the scoring ledger (re-exports plus spawn_ledger_writer).

pub mod connection;
pub mod db_writer;
pub mod ledger;
pub mod maintenance;

use rusqlite::Connection;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::config::DatabaseConfig;
pub use connection::{db_path, init_database, open_db_connection};
pub use db_writer::LedgerWriter;
pub use ledger::{Application, Ledger, LedgerError, ScoredEvent};
pub use maintenance::spawn_wal_maintenance;

/// One scored sighting on its way to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub path: String,
    pub kind: String,
    pub info: String,
    pub delta: i64,
}

/// Spawn the batched writer on the current runtime. The task ends, handing
/// the connection back, once every sender is dropped.
pub fn spawn_ledger_writer(
    conn: Connection,
    cfg: &DatabaseConfig,
    capacity: usize,
) -> (mpsc::Sender<LedgerEntry>, JoinHandle<Connection>) {
    let (tx, rx) = mpsc::channel(capacity);
    // Copy what we need so nothing borrowed lives in the async task
    let writer = LedgerWriter {
        conn,
        rx,
        flush_interval_ms: cfg.flush_interval_ms,
        batch_size: cfg.batch_size.max(1),
    };
    (tx, tokio::spawn(writer.run()))
}
