//! SQLite trace store.
//!
//! Persists arbiter [`TraceEvent`]s so episodes can be replayed and audited
//! after the process exits.
//!
//! # Storage layout
//!
//! A single table `trace_events` is created (if it does not already exist):
//!
//! | column     | type    | description                                   |
//! |------------|---------|-----------------------------------------------|
//! | seq        | INTEGER | insertion order, autoincrement primary key    |
//! | episode_id | TEXT    | UUID of the episode                           |
//! | kind       | TEXT    | `"attempt"` or `"terminal"`                   |
//! | timestamp  | TEXT    | RFC-3339 emission time (UTC)                  |
//! | payload    | TEXT    | the full event as JSON                        |
//!
//! # Example
//!
//! ```rust
//! use cmvk_memory::recorder::TraceRecorder;
//! use cmvk_memory::trace_store::TraceStore;
//! use cmvk_types::{EpisodeOutcome, TerminalRecord, TraceEvent};
//!
//! let store = TraceStore::open_in_memory().unwrap();
//! let id = uuid::Uuid::new_v4();
//! store
//!     .record(&TraceEvent::Terminal(TerminalRecord::new(
//!         id,
//!         EpisodeOutcome::Accepted,
//!         1,
//!         &Default::default(),
//!     )))
//!     .unwrap();
//!
//! assert_eq!(store.episodes().unwrap(), vec![id]);
//! assert_eq!(store.replay(id).unwrap().len(), 1);
//! ```

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use cmvk_types::{TerminalRecord, TraceEvent};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;
use uuid::Uuid;

use crate::recorder::{TraceError, TraceRecorder};

/// SQLite-backed [`TraceRecorder`] that can replay what it stored.
pub struct TraceStore {
    conn: Mutex<Connection>,
}

impl TraceStore {
    /// Open (or create) a persistent SQLite database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, TraceError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, TraceError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS trace_events (
                seq        INTEGER PRIMARY KEY AUTOINCREMENT,
                episode_id TEXT NOT NULL,
                kind       TEXT NOT NULL,
                timestamp  TEXT NOT NULL,
                payload    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS trace_events_episode ON trace_events (episode_id);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, TraceError> {
        self.conn.lock().map_err(|_| TraceError::Poisoned)
    }

    /// Every event of `episode_id`, in the order it was recorded.
    pub fn replay(&self, episode_id: Uuid) -> Result<Vec<TraceEvent>, TraceError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT payload FROM trace_events
             WHERE episode_id = ?1
             ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![episode_id.to_string()], |row| row.get::<_, String>(0))?;
        let mut events = Vec::new();
        for payload in rows {
            events.push(serde_json::from_str(&payload?)?);
        }
        Ok(events)
    }

    /// Distinct episode ids, in order of first appearance.
    pub fn episodes(&self) -> Result<Vec<Uuid>, TraceError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT episode_id FROM trace_events
             GROUP BY episode_id
             ORDER BY MIN(seq) ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for id in rows {
            let id = id?;
            let id = Uuid::parse_str(&id).map_err(|e| {
                rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text)
            })?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// The terminal record of `episode_id`, if the episode finished.
    pub fn terminal(&self, episode_id: Uuid) -> Result<Option<TerminalRecord>, TraceError> {
        let conn = self.conn()?;
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM trace_events
                 WHERE episode_id = ?1 AND kind = 'terminal'
                 ORDER BY seq DESC LIMIT 1",
                params![episode_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match payload {
            Some(p) => match serde_json::from_str(&p)? {
                TraceEvent::Terminal(record) => Ok(Some(record)),
                TraceEvent::Attempt(_) => Ok(None),
            },
            None => Ok(None),
        }
    }

    /// Total number of stored events.
    pub fn count(&self) -> Result<usize, TraceError> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM trace_events", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

impl TraceRecorder for TraceStore {
    fn record(&self, event: &TraceEvent) -> Result<(), TraceError> {
        let (kind, timestamp) = match event {
            TraceEvent::Attempt(r) => ("attempt", r.timestamp),
            TraceEvent::Terminal(r) => ("terminal", r.timestamp),
        };
        let payload = serde_json::to_string(event)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO trace_events (episode_id, kind, timestamp, payload)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                event.episode_id().to_string(),
                kind,
                timestamp.to_rfc3339(),
                payload
            ],
        )?;
        debug!(episode = %event.episode_id(), kind, "trace event stored");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
