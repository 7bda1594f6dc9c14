// src/db/connection.rs
//! Opening and initialising the ledger database with runtime parameters.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use log::Level;
use rusqlite::Connection;

use crate::{config::DatabaseConfig, warden_log};

const SCHEMA: &str = include_str!("../../resources/schema.sql");

pub fn db_path(base_dir: &Path, cfg: &DatabaseConfig) -> PathBuf {
    base_dir.join(&cfg.path)
}

pub fn open_db_connection(path: &Path, cfg: &DatabaseConfig) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_millis(5_000))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", cfg.synchronous.as_str())?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

/// Apply the schema; every statement is idempotent.
pub fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}

/// Remove the database together with its WAL and shared-memory files.
fn purge(path: &Path) {
    let mut files = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut side = path.as_os_str().to_owned();
        side.push(suffix);
        files.push(PathBuf::from(side));
    }
    for file in files.iter().filter(|f| f.exists()) {
        if let Err(e) = fs::remove_file(file) {
            warden_log!(Level::Warn, "ledger", "could not purge {}: {}", file.display(), e);
        }
    }
}

/// Open (and optionally wipe) the ledger at `base_dir/cfg.path`.
pub fn init_database(base_dir: &Path, cfg: &DatabaseConfig) -> rusqlite::Result<Connection> {
    let path = db_path(base_dir, cfg);

    if cfg.purge_on_restart {
        purge(&path);
    }

    let conn = open_db_connection(&path, cfg)?;
    conn.pragma_update(None, "journal_size_limit", cfg.journal_size_limit as i64)?;
    apply_schema(&conn)?;

    warden_log!(Level::Info, "ledger", "database ready at {}", path.display());
    Ok(conn)
}
