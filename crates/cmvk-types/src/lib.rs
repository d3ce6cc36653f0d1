use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Label describing the algorithmic approach a candidate uses
/// (e.g. `"built-in-sort"`, `"recursive"`).
///
/// The vocabulary is open: the kernel only compares tags, it never interprets
/// them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StrategyTag(String);

impl StrategyTag {
    /// Reserved tag for candidates no classifier rule recognised.
    pub const UNCLASSIFIED: &'static str = "unclassified";

    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn unclassified() -> Self {
        Self(Self::UNCLASSIFIED.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_unclassified(&self) -> bool {
        self.0 == Self::UNCLASSIFIED
    }
}

impl fmt::Display for StrategyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StrategyTag {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Stable content hash identifying a candidate's (normalised) source text.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an already-computed hex digest.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(12);
        self.0.get(..end).unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable unit of work handed to an episode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Problem statement given to the Generator.
    pub statement: String,
    /// Explicitly forbidden operations (e.g. "do not use sorted()").
    #[serde(default)]
    pub constraints: Vec<String>,
    /// Identifier of the reference test oracle the Verifier should use.
    #[serde(default)]
    pub oracle_id: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, statement: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            statement: statement.into(),
            constraints: Vec::new(),
            oracle_id: None,
        }
    }

    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraints.push(constraint.into());
        self
    }

    pub fn with_oracle(mut self, oracle_id: impl Into<String>) -> Self {
        self.oracle_id = Some(oracle_id.into());
        self
    }
}

/// Raw Generator output, before the kernel classifies and fingerprints it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Proposal {
    /// Complete source text of the proposed solution.
    pub source: String,
    /// Optional free-form explanation of the approach.
    #[serde(default)]
    pub explanation: Option<String>,
}

impl Proposal {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            explanation: None,
        }
    }
}

/// A proposed solution together with the tag and fingerprint the kernel
/// assigned to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub source: String,
    pub strategy: StrategyTag,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VerdictStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Where an issue came from.
///
/// Only [`IssueKind::Defect`] is an organic Verifier finding; the other kinds
/// are synthesised by the kernel when a collaborator misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IssueKind {
    Defect,
    GenerationFailure,
    VerifierUnavailable,
    ForbiddenStrategyViolation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub description: String,
}

impl Issue {
    pub fn defect(severity: Severity, description: impl Into<String>) -> Self {
        Self {
            kind: IssueKind::Defect,
            severity,
            description: description.into(),
        }
    }
}

/// Outcome of submitting a candidate to the Verifier (or of a cache hit).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub status: VerdictStatus,
    pub issues: Vec<Issue>,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
}

impl Verdict {
    pub fn pass(confidence: f32) -> Self {
        Self {
            status: VerdictStatus::Pass,
            issues: Vec::new(),
            confidence: clamp_confidence(confidence),
        }
    }

    pub fn fail(issues: Vec<Issue>, confidence: f32) -> Self {
        Self {
            status: VerdictStatus::Fail,
            issues,
            confidence: clamp_confidence(confidence),
        }
    }

    /// A FAIL verdict produced by the kernel itself rather than the Verifier.
    pub fn synthetic_failure(kind: IssueKind, description: impl Into<String>) -> Self {
        let severity = match kind {
            IssueKind::VerifierUnavailable => Severity::Medium,
            _ => Severity::High,
        };
        Self::fail(
            vec![Issue {
                kind,
                severity,
                description: description.into(),
            }],
            1.0,
        )
    }

    pub fn is_pass(&self) -> bool {
        self.status == VerdictStatus::Pass
    }

    pub fn has_issue(&self, kind: IssueKind) -> bool {
        self.issues.iter().any(|i| i.kind == kind)
    }
}

fn clamp_confidence(c: f32) -> f32 {
    if c.is_nan() { 0.0 } else { c.clamp(0.0, 1.0) }
}

/// One iteration of the generate → classify → verify loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based ordinal within the episode.
    pub index: u32,
    /// `None` when the Generator failed and no candidate exists.
    pub candidate: Option<Candidate>,
    pub verdict: Verdict,
    pub cache_hit: bool,
    pub ban_triggered: bool,
}

impl Attempt {
    pub fn strategy(&self) -> Option<&StrategyTag> {
        self.candidate.as_ref().map(|c| &c.strategy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EpisodeOutcome {
    Accepted,
    Exhausted,
}

/// What `run_episode` hands back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeResult {
    pub episode_id: Uuid,
    pub outcome: EpisodeOutcome,
    pub accepted_candidate: Option<Candidate>,
    pub attempts: Vec<Attempt>,
    pub forbidden_strategies: BTreeSet<StrategyTag>,
}

impl EpisodeResult {
    pub fn is_accepted(&self) -> bool {
        self.outcome == EpisodeOutcome::Accepted
    }

    pub fn cache_hits(&self) -> usize {
        self.attempts.iter().filter(|a| a.cache_hit).count()
    }
}

/// One unverified generation: the control arm next to a full episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineResult {
    /// `None` when the generator produced nothing usable.
    pub candidate: Option<Candidate>,
    /// `None` when the run was not judged.  A generation failure always
    /// carries its synthetic FAIL.
    pub verdict: Option<Verdict>,
}

impl BaselineResult {
    pub fn generation_failed(reason: impl Into<String>) -> Self {
        Self {
            candidate: None,
            verdict: Some(Verdict::synthetic_failure(IssueKind::GenerationFailure, reason)),
        }
    }

    pub fn is_judged(&self) -> bool {
        self.verdict.is_some()
    }

    /// Only a judged PASS counts.
    pub fn is_accepted(&self) -> bool {
        self.verdict.as_ref().is_some_and(Verdict::is_pass)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Trace schema
// ─────────────────────────────────────────────────────────────────────────────

/// Per-attempt trace record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub episode_id: Uuid,
    pub attempt_index: u32,
    pub candidate_fingerprint: Option<Fingerprint>,
    pub strategy_tag: Option<StrategyTag>,
    pub cache_hit: bool,
    pub verdict_status: VerdictStatus,
    pub issues: Vec<Issue>,
    pub forbidden_strategies_after: Vec<StrategyTag>,
    pub ban_triggered: bool,
    pub timestamp: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn new(episode_id: Uuid, attempt: &Attempt, forbidden_after: &BTreeSet<StrategyTag>) -> Self {
        Self {
            episode_id,
            attempt_index: attempt.index,
            candidate_fingerprint: attempt.candidate.as_ref().map(|c| c.fingerprint.clone()),
            strategy_tag: attempt.strategy().cloned(),
            cache_hit: attempt.cache_hit,
            verdict_status: attempt.verdict.status,
            issues: attempt.verdict.issues.clone(),
            forbidden_strategies_after: forbidden_after.iter().cloned().collect(),
            ban_triggered: attempt.ban_triggered,
            timestamp: Utc::now(),
        }
    }
}

/// Final trace record closing an episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalRecord {
    pub episode_id: Uuid,
    pub outcome: EpisodeOutcome,
    pub total_attempts: u32,
    pub final_forbidden_strategies: Vec<StrategyTag>,
    pub timestamp: DateTime<Utc>,
}

impl TerminalRecord {
    pub fn new(
        episode_id: Uuid,
        outcome: EpisodeOutcome,
        total_attempts: u32,
        forbidden: &BTreeSet<StrategyTag>,
    ) -> Self {
        Self {
            episode_id,
            outcome,
            total_attempts,
            final_forbidden_strategies: forbidden.iter().cloned().collect(),
            timestamp: Utc::now(),
        }
    }
}

/// Structured event emitted by the kernel to a trace recorder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "lowercase")]
pub enum TraceEvent {
    Attempt(AttemptRecord),
    Terminal(TerminalRecord),
}

impl TraceEvent {
    pub fn episode_id(&self) -> Uuid {
        match self {
            TraceEvent::Attempt(r) => r.episode_id,
            TraceEvent::Terminal(r) => r.episode_id,
        }
    }
}

/// Global error type for the verification kernel.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CmvkError {
    #[error("Generation failed: {0}")]
    GenerationFailure(String),

    #[error("Verification failed: {0}")]
    VerificationFailure(String),

    #[error("Conflicting verdicts recorded for fingerprint {fingerprint}")]
    DuplicateFingerprintConflict { fingerprint: Fingerprint },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Illegal episode transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("Trace sink error: {0}")]
    Trace(String),

    #[error("Episode aborted: {0}")]
    EpisodeAborted(String),
}
