//! `cmvk-kernel` – Verification Arbiter Core
//!
//! The deterministic half of the verification kernel.  It never calls a
//! model; it decides what a model's output is worth and enforces the rules
//! that keep a Generator from looping on the same idea.
//!
//! # Modules
//!
//! - [`fingerprint`] – [`Fingerprinter`][fingerprint::Fingerprinter]:
//!   content-addresses candidate source (SHA-256, exact or normalized).
//! - [`strategy`] – [`RuleClassifier`][strategy::RuleClassifier]:
//!   maps source text to a [`StrategyTag`][cmvk_types::StrategyTag] via an
//!   ordered list of [`StrategyRule`][strategy::StrategyRule]s.
//! - [`graph_of_truth`] – [`GraphOfTruth`][graph_of_truth::GraphOfTruth]:
//!   fingerprint → verdict memory that answers resubmissions without the
//!   Verifier and refuses conflicting verdicts.
//! - [`ban_policy`] – [`BanPolicy`][ban_policy::BanPolicy]:
//!   per-strategy failure counters and the monotonic forbidden set.
//! - [`episode`] – [`Episode`][episode::Episode]:
//!   the per-task state machine tying the above together.  The async loop
//!   that calls the Generator and Verifier lives in `cmvk-runtime`.

pub mod ban_policy;
pub mod episode;
pub mod fingerprint;
pub mod graph_of_truth;
pub mod strategy;

pub use ban_policy::BanPolicy;
pub use episode::{Admission, Decision, Episode, EpisodeParams, EpisodeState};
pub use fingerprint::{FingerprintMode, Fingerprinter};
pub use graph_of_truth::{GraphOfTruth, GraphStats};
pub use strategy::{PatternRule, RecursionRule, RuleClassifier, StrategyClassifier, StrategyRule};
