//! Trace recorders.
//!
//! The arbiter emits one [`TraceEvent`] per attempt plus one terminal event
//! per episode and hands each to a [`TraceRecorder`].  Recording is a side
//! channel: a failing recorder never changes the outcome of an episode.
//!
//! | recorder           | destination                                   |
//! |--------------------|-----------------------------------------------|
//! | [`NullRecorder`]   | discards everything                           |
//! | [`MemoryRecorder`] | in-process `Vec`, for tests and reports       |
//! | [`JsonlRecorder`]  | one JSON object per line in an append-only file |
//! | [`TeeRecorder`]    | fans out to several of the above              |
//! | [`TraceStore`][crate::trace_store::TraceStore] | SQLite, queryable by episode |
//!
//! # Example
//!
//! ```rust
//! use cmvk_memory::recorder::{MemoryRecorder, TraceRecorder};
//! use cmvk_types::{EpisodeOutcome, TerminalRecord, TraceEvent};
//!
//! let recorder = MemoryRecorder::new();
//! let id = uuid::Uuid::new_v4();
//! let event = TraceEvent::Terminal(TerminalRecord::new(
//!     id,
//!     EpisodeOutcome::Exhausted,
//!     5,
//!     &Default::default(),
//! ));
//! recorder.record(&event).unwrap();
//! assert_eq!(recorder.for_episode(id).len(), 1);
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use cmvk_types::{CmvkError, TraceEvent};
use thiserror::Error;
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Recorder lock poisoned")]
    Poisoned,
}

impl From<TraceError> for CmvkError {
    fn from(e: TraceError) -> Self {
        CmvkError::Trace(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TraceRecorder
// ─────────────────────────────────────────────────────────────────────────────

/// Sink for arbiter trace events.
pub trait TraceRecorder: Send + Sync {
    fn record(&self, event: &TraceEvent) -> Result<(), TraceError>;
}

impl<T: TraceRecorder + ?Sized> TraceRecorder for Arc<T> {
    fn record(&self, event: &TraceEvent) -> Result<(), TraceError> {
        (**self).record(event)
    }
}

impl<T: TraceRecorder + ?Sized> TraceRecorder for Box<T> {
    fn record(&self, event: &TraceEvent) -> Result<(), TraceError> {
        (**self).record(event)
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullRecorder;

impl TraceRecorder for NullRecorder {
    fn record(&self, _event: &TraceEvent) -> Result<(), TraceError> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryRecorder
// ─────────────────────────────────────────────────────────────────────────────

/// Keeps events in memory, in emission order.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<TraceEvent>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every event recorded so far.
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn for_episode(&self, episode_id: Uuid) -> Vec<TraceEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.episode_id() == episode_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TraceRecorder for MemoryRecorder {
    fn record(&self, event: &TraceEvent) -> Result<(), TraceError> {
        self.events
            .lock()
            .map_err(|_| TraceError::Poisoned)?
            .push(event.clone());
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// JsonlRecorder
// ─────────────────────────────────────────────────────────────────────────────

/// Appends events to a JSON-lines file.
///
/// The file is opened in append mode, so several runs can share one trace
/// log.  Each line is flushed before [`record`](TraceRecorder::record)
/// returns.
pub struct JsonlRecorder {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlRecorder {
    /// Open (or create) the trace file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TraceRecorder for JsonlRecorder {
    fn record(&self, event: &TraceEvent) -> Result<(), TraceError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = self.file.lock().map_err(|_| TraceError::Poisoned)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

/// Read every event back from a JSON-lines trace file.  Blank lines are
/// skipped.
pub fn read_jsonl(path: impl AsRef<Path>) -> Result<Vec<TraceEvent>, TraceError> {
    let reader = BufReader::new(File::open(path)?);
    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        events.push(serde_json::from_str(&line)?);
    }
    Ok(events)
}

// ─────────────────────────────────────────────────────────────────────────────
// TeeRecorder
// ─────────────────────────────────────────────────────────────────────────────

/// Forwards every event to several sinks.
///
/// All sinks see the event even when an earlier one fails; the first error
/// is returned.
#[derive(Default)]
pub struct TeeRecorder {
    sinks: Vec<Box<dyn TraceRecorder>>,
}

impl TeeRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl TraceRecorder + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl TraceRecorder for TeeRecorder {
    fn record(&self, event: &TraceEvent) -> Result<(), TraceError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.record(event) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
