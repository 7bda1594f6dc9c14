// src/db/db_writer.rs

use std::{
    thread::sleep,
    time::{Duration, Instant},
};

use log::Level;
use metrics::histogram;
use rusqlite::{Connection, ErrorCode};
use tokio::sync::mpsc;

use super::{LedgerEntry, ledger::{self, LedgerError}};
use crate::{telemetry, warden_log};

const MAX_BUSY_RETRIES: u64 = 5;

/// Batched writer for scored alerts.
/// Performs all DB work synchronously to avoid holding &Connection across .await.
pub struct LedgerWriter {
    pub conn: Connection,
    pub rx: mpsc::Receiver<LedgerEntry>,
    pub flush_interval_ms: u64,
    pub batch_size: usize,
}

fn is_busy(e: &LedgerError) -> bool {
    matches!(
        e,
        LedgerError::Sql(rusqlite::Error::SqliteFailure(f, _))
            if f.code == ErrorCode::DatabaseBusy || f.code == ErrorCode::DatabaseLocked
    )
}

impl LedgerWriter {
    /// Start the writer loop; call inside tokio::spawn.
    /// Returns the connection once the channel closes and the last batch is written.
    pub async fn run(mut self) -> Connection {
        let mut buffer = Vec::with_capacity(self.batch_size);
        let mut interval = tokio::time::interval(Duration::from_millis(self.flush_interval_ms.max(1)));

        loop {
            tokio::select! {
                maybe = self.rx.recv() => match maybe {
                    Some(entry) => {
                        buffer.push(entry);
                        if buffer.len() >= self.batch_size {
                            self.flush_logged(&mut buffer);
                        }
                    }
                    None => {
                        self.flush_logged(&mut buffer);
                        break;
                    }
                },
                _ = interval.tick() => self.flush_logged(&mut buffer),
            }
        }
        self.conn
    }

    fn flush_logged(&mut self, buffer: &mut Vec<LedgerEntry>) {
        if let Err(e) = self.flush_sync(buffer) {
            warden_log!(Level::Error, "ledger", "dropping {} scored events: {}", buffer.len(), e);
            buffer.clear();
        }
    }

    /// One transaction per batch, retried while SQLite reports busy.
    fn flush_sync(&mut self, buffer: &mut Vec<LedgerEntry>) -> Result<(), LedgerError> {
        if buffer.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        let mut attempts = 0;

        loop {
            match self.write_batch(buffer) {
                Ok(()) => break,
                Err(e) if is_busy(&e) && attempts < MAX_BUSY_RETRIES => {
                    attempts += 1;
                    sleep(Duration::from_millis(50 * attempts));
                }
                Err(e) => return Err(e),
            }
        }

        histogram!(telemetry::LEDGER_FLUSH_SECONDS).record(start.elapsed().as_secs_f64());
        warden_log!(Level::Debug, "ledger", "flushed {} scored events", buffer.len());
        buffer.clear();
        Ok(())
    }

    fn write_batch(&mut self, batch: &[LedgerEntry]) -> Result<(), LedgerError> {
        let tx = self.conn.transaction()?;
        for entry in batch {
            match ledger::insert_event_by_path(&tx, &entry.path, &entry.kind, &entry.info, entry.delta) {
                Ok(_) => {}
                Err(LedgerError::EmptyPath) => {}
                Err(e) => return Err(e),
            }
        }
        tx.commit()?;
        Ok(())
    }
}
