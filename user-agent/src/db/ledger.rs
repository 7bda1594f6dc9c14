//! Scoring ledger queries.
//!
//! Applications are keyed by executable path. Every scored event belongs to
//! one application and the schema triggers keep `applications.score` equal to
//! the sum of its event deltas, so nothing here writes `score` directly.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use thiserror::Error;

/// `datetime('now')` text format.
const SQLITE_TS: &str = "%Y-%m-%d %H:%M:%S";

pub const DEFAULT_APP_LIMIT: u32 = 50;
pub const DEFAULT_EVENT_LIMIT: u32 = 100;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("SQLite error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("application path is empty")]
    EmptyPath,

    #[error("application id 0 is not valid")]
    InvalidAppId,

    #[error("no application {0}")]
    NotFound(String),

    #[error("unparseable timestamp '{0}'")]
    BadTimestamp(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Application {
    pub id: i64,
    pub path: String,
    pub score: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoredEvent {
    pub id: i64,
    pub app_id: i64,
    pub kind: Option<String>,
    pub info: Option<String>,
    pub delta: i64,
    pub created_at: DateTime<Utc>,
}

fn parse_ts(raw: String) -> Result<DateTime<Utc>, LedgerError> {
    NaiveDateTime::parse_from_str(&raw, SQLITE_TS)
        .map(|t| t.and_utc())
        .map_err(|_| LedgerError::BadTimestamp(raw))
}

/// Raw row; timestamps are parsed after the rusqlite borrow ends.
type AppRow = (i64, String, i64, String, String);
type EventRow = (i64, i64, Option<String>, Option<String>, i64, String);

fn app_row(row: &Row<'_>) -> rusqlite::Result<AppRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn event_row(row: &Row<'_>) -> rusqlite::Result<EventRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
}

fn into_app((id, path, score, created, updated): AppRow) -> Result<Application, LedgerError> {
    Ok(Application {
        id,
        path,
        score,
        created_at: parse_ts(created)?,
        updated_at: parse_ts(updated)?,
    })
}

fn into_event((id, app_id, kind, info, delta, created): EventRow) -> Result<ScoredEvent, LedgerError> {
    Ok(ScoredEvent { id, app_id, kind, info, delta, created_at: parse_ts(created)? })
}

fn non_empty(s: &str) -> Option<&str> {
    (!s.is_empty()).then_some(s)
}

/// Insert `path` if unknown; either way return its id.
pub fn upsert_application(conn: &Connection, path: &str) -> Result<i64, LedgerError> {
    if path.is_empty() {
        return Err(LedgerError::EmptyPath);
    }
    let id = conn.query_row(
        "INSERT INTO applications(path) VALUES (?1)
         ON CONFLICT(path) DO UPDATE SET path = excluded.path
         RETURNING id",
        [path],
        |r| r.get(0),
    )?;
    Ok(id)
}

/// Record a scored event; empty `kind`/`info` are stored as NULL.
pub fn insert_event(
    conn: &Connection,
    app_id: i64,
    kind: &str,
    info: &str,
    delta: i64,
) -> Result<i64, LedgerError> {
    if app_id == 0 {
        return Err(LedgerError::InvalidAppId);
    }
    conn.execute(
        "INSERT INTO events(app_id, kind, info, delta) VALUES (?1, ?2, ?3, ?4)",
        params![app_id, non_empty(kind), non_empty(info), delta],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn insert_event_by_path(
    conn: &Connection,
    path: &str,
    kind: &str,
    info: &str,
    delta: i64,
) -> Result<i64, LedgerError> {
    let app_id = upsert_application(conn, path)?;
    insert_event(conn, app_id, kind, info, delta)
}

const APP_COLUMNS: &str = "SELECT id, path, score, created_at, updated_at FROM applications";

pub fn get_application(conn: &Connection, id: i64) -> Result<Application, LedgerError> {
    let row = conn
        .query_row(&format!("{APP_COLUMNS} WHERE id = ?1"), [id], app_row)
        .optional()?
        .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
    into_app(row)
}

pub fn get_application_by_path(conn: &Connection, path: &str) -> Result<Application, LedgerError> {
    let row = conn
        .query_row(&format!("{APP_COLUMNS} WHERE path = ?1"), [path], app_row)
        .optional()?
        .ok_or_else(|| LedgerError::NotFound(path.to_owned()))?;
    into_app(row)
}

/// Highest score first; `limit` 0 means the default of 50.
pub fn list_applications(conn: &Connection, limit: u32, offset: u32) -> Result<Vec<Application>, LedgerError> {
    let limit = if limit == 0 { DEFAULT_APP_LIMIT } else { limit };
    let mut stmt = conn.prepare_cached(&format!(
        "{APP_COLUMNS} ORDER BY score DESC, id ASC LIMIT ?1 OFFSET ?2"
    ))?;
    let rows = stmt
        .query_map(params![limit, offset], app_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(into_app).collect()
}

/// Newest first; `limit` 0 means the default of 100.
pub fn list_events(conn: &Connection, app_id: i64, limit: u32, offset: u32) -> Result<Vec<ScoredEvent>, LedgerError> {
    let limit = if limit == 0 { DEFAULT_EVENT_LIMIT } else { limit };
    let mut stmt = conn.prepare_cached(
        "SELECT id, app_id, kind, info, delta, created_at FROM events
         WHERE app_id = ?1 ORDER BY id DESC LIMIT ?2 OFFSET ?3",
    )?;
    let rows = stmt
        .query_map(params![app_id, limit, offset], event_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(into_event).collect()
}

pub fn list_events_by_path(
    conn: &Connection,
    path: &str,
    limit: u32,
    offset: u32,
) -> Result<Vec<ScoredEvent>, LedgerError> {
    let app = get_application_by_path(conn, path)?;
    list_events(conn, app.id, limit, offset)
}

/// Remove one event; the triggers re-score its application.
pub fn delete_event(conn: &Connection, event_id: i64) -> Result<bool, LedgerError> {
    Ok(conn.execute("DELETE FROM events WHERE id = ?1", [event_id])? > 0)
}

/// Move an event to another application, re-scoring both.
pub fn reassign_event(conn: &Connection, event_id: i64, app_id: i64) -> Result<bool, LedgerError> {
    if app_id == 0 {
        return Err(LedgerError::InvalidAppId);
    }
    Ok(conn.execute("UPDATE events SET app_id = ?2 WHERE id = ?1", params![event_id, app_id])? > 0)
}

/// Owning handle over one connection, for callers outside the writer task.
pub struct Ledger {
    conn: Connection,
}

impl Ledger {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Private in-memory ledger with the schema applied.
    pub fn in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        super::connection::apply_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn into_connection(self) -> Connection {
        self.conn
    }

    pub fn upsert_application(&self, path: &str) -> Result<i64, LedgerError> {
        upsert_application(&self.conn, path)
    }

    pub fn insert_event(&self, app_id: i64, kind: &str, info: &str, delta: i64) -> Result<i64, LedgerError> {
        insert_event(&self.conn, app_id, kind, info, delta)
    }

    pub fn insert_event_by_path(&self, path: &str, kind: &str, info: &str, delta: i64) -> Result<i64, LedgerError> {
        insert_event_by_path(&self.conn, path, kind, info, delta)
    }

    pub fn get_application(&self, id: i64) -> Result<Application, LedgerError> {
        get_application(&self.conn, id)
    }

    pub fn get_application_by_path(&self, path: &str) -> Result<Application, LedgerError> {
        get_application_by_path(&self.conn, path)
    }

    pub fn list_applications(&self, limit: u32, offset: u32) -> Result<Vec<Application>, LedgerError> {
        list_applications(&self.conn, limit, offset)
    }

    pub fn list_events(&self, app_id: i64, limit: u32, offset: u32) -> Result<Vec<ScoredEvent>, LedgerError> {
        list_events(&self.conn, app_id, limit, offset)
    }

    pub fn list_events_by_path(&self, path: &str, limit: u32, offset: u32) -> Result<Vec<ScoredEvent>, LedgerError> {
        list_events_by_path(&self.conn, path, limit, offset)
    }

    pub fn delete_event(&self, event_id: i64) -> Result<bool, LedgerError> {
        delete_event(&self.conn, event_id)
    }

    pub fn reassign_event(&self, event_id: i64, app_id: i64) -> Result<bool, LedgerError> {
        reassign_event(&self.conn, event_id, app_id)
    }
}
