//! `cmvk-runtime` – The Verification Loop
//!
//! Async orchestration around the `cmvk-kernel` state machine: the model
//! collaborators, the loop that calls them, and the plumbing to run many
//! episodes at once.
//!
//! # Modules
//!
//! - [`collaborators`] – the [`Generator`][collaborators::Generator] and
//!   [`Verifier`][collaborators::Verifier] contracts, plus the
//!   [`NullGenerator`][collaborators::NullGenerator] /
//!   [`NullVerifier`][collaborators::NullVerifier] stand-ins used when no
//!   model is configured.
//! - [`arbiter`] – [`Arbiter`][arbiter::Arbiter]: runs one episode per task
//!   with per-call timeouts, an optional episode deadline and trace
//!   emission.
//! - [`llm_driver`] – [`LlmDriver`][llm_driver::LlmDriver]: an
//!   OpenAI-compatible chat client with schema-constrained replies, and the
//!   [`LlmGenerator`][llm_driver::LlmGenerator] /
//!   [`LlmVerifier`][llm_driver::LlmVerifier] collaborators built on it.
//!   [`DIVERSITY_GUIDELINES`][llm_driver::DIVERSITY_GUIDELINES] are injected
//!   into the generator's system messages.
//! - [`sandbox`] – [`SandboxVerifier`][sandbox::SandboxVerifier]: derives
//!   verdicts by running the task's test oracle through a
//!   [`SandboxExecutor`][sandbox::SandboxExecutor].
//! - [`throttle`] – [`Throttled`][throttle::Throttled]: `governor`-backed
//!   rate limiting for any collaborator.
//! - [`batch`] – [`BatchRunner`][batch::BatchRunner]: bounded-concurrency
//!   fan-out of episodes, and of the single-generation baseline arm.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: global
//!   `tracing` subscriber with an optional OTLP span exporter.

pub mod arbiter;
pub mod batch;
pub mod collaborators;
pub mod llm_driver;
pub mod sandbox;
pub mod telemetry;
pub mod throttle;

pub use arbiter::{Arbiter, ArbiterConfig};
pub use batch::{BaselineReport, BaselineSummary, BatchRunner, BatchSummary, TaskReport};
pub use collaborators::{Generator, NullGenerator, NullVerifier, Verifier};
pub use llm_driver::{ChatMessage, DIVERSITY_GUIDELINES, LlmDriver, LlmError, LlmGenerator, LlmVerifier, Role};
pub use sandbox::{ExecutionReport, ProcessExecutor, SandboxExecutor, SandboxVerifier, TestSuite};
pub use telemetry::{TracerProviderGuard, init_tracing};
pub use throttle::Throttled;

// Re-exported so callers can build tasks and inspect results without a
// direct dependency on the kernel crates.
pub use cmvk_kernel::{FingerprintMode, GraphOfTruth};
pub use cmvk_types::{BaselineResult, EpisodeOutcome, EpisodeResult, Task};
