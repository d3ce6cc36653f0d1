//! `cmvk-memory` – Episode Traces.
//!
//! Gives every episode an audit trail: each attempt and each terminal
//! outcome the arbiter emits can be kept in memory, appended to a JSON-lines
//! file or stored in a local SQLite database for later replay.
//!
//! # Modules
//!
//! - [`recorder`] – the [`TraceRecorder`][recorder::TraceRecorder] sink
//!   contract plus [`NullRecorder`][recorder::NullRecorder],
//!   [`MemoryRecorder`][recorder::MemoryRecorder] and
//!   [`JsonlRecorder`][recorder::JsonlRecorder], plus
//!   [`TeeRecorder`][recorder::TeeRecorder] to write to several at once.
//! - [`trace_store`] – [`TraceStore`][trace_store::TraceStore]: SQLite-backed
//!   recorder that can replay an episode's events in emission order.

pub mod recorder;
pub mod trace_store;

pub use recorder::{JsonlRecorder, MemoryRecorder, NullRecorder, TeeRecorder, TraceError, TraceRecorder, read_jsonl};
pub use trace_store::TraceStore;
