//! Episode state machine.
//!
//! An [`Episode`] owns everything one task needs while the arbiter drives it:
//! the Graph of Truth, the ban policy, the attempt log and the current
//! [`EpisodeState`].  It performs no I/O.  The runtime calls the Generator and
//! the Verifier and feeds their results back through:
//!
//! 1. [`Episode::start_attempt`]
//! 2. [`Episode::admit`] with the Generator's proposal (or
//!    [`Episode::generation_failed`] when the Generator errored)
//! 3. [`Episode::complete_verification`] when admission asked for a
//!    Verifier call
//!
//! Every step returns a [`Decision`] once the attempt is settled.  All state
//! changes go through [`validate_transition`], so a caller driving the steps
//! out of order gets [`CmvkError::IllegalTransition`] instead of a corrupted
//! episode.
//!
//! ```text
//! INIT ──▶ GENERATING ──▶ CLASSIFYING ──▶ CACHE_LOOKUP ──▶ VERIFYING
//!  │           │               │               │               │
//!  │           └───────────────┴───────┬───────┴───────────────┘
//!  │                                   ▼
//!  │                               DECIDING ──▶ ACCEPTED
//!  │                                   │
//!  └──────────────▶ EXHAUSTED ◀────────┘ (or back to GENERATING)
//! ```

use std::collections::BTreeSet;
use std::fmt;

use cmvk_types::{
    Attempt, AttemptRecord, Candidate, CmvkError, EpisodeOutcome, EpisodeResult, IssueKind,
    Proposal, StrategyTag, Task, TerminalRecord, TraceEvent, Verdict,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ban_policy::BanPolicy;
use crate::fingerprint::Fingerprinter;
use crate::graph_of_truth::GraphOfTruth;
use crate::strategy::StrategyClassifier;

// ─────────────────────────────────────────────────────────────────────────────
// States and transitions
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EpisodeState {
    Init,
    Generating,
    Classifying,
    CacheLookup,
    Verifying,
    Deciding,
    Accepted,
    Exhausted,
}

impl EpisodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Accepted | Self::Exhausted)
    }
}

impl fmt::Display for EpisodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::Generating => "GENERATING",
            Self::Classifying => "CLASSIFYING",
            Self::CacheLookup => "CACHE_LOOKUP",
            Self::Verifying => "VERIFYING",
            Self::Deciding => "DECIDING",
            Self::Accepted => "ACCEPTED",
            Self::Exhausted => "EXHAUSTED",
        };
        f.write_str(name)
    }
}

/// States reachable in one step from `from`.
pub fn allowed_transitions(from: EpisodeState) -> &'static [EpisodeState] {
    use EpisodeState::*;
    match from {
        Init => &[Generating, Exhausted],
        Generating => &[Classifying, Deciding],
        Classifying => &[CacheLookup, Deciding],
        CacheLookup => &[Verifying, Deciding],
        Verifying => &[Deciding],
        Deciding => &[Generating, Accepted, Exhausted],
        Accepted | Exhausted => &[],
    }
}

pub fn validate_transition(from: EpisodeState, to: EpisodeState) -> Result<(), CmvkError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(CmvkError::IllegalTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Parameters
// ─────────────────────────────────────────────────────────────────────────────

/// Per-episode bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeParams {
    /// Hard cap on attempts.
    pub max_loops: u32,
    /// Organic failures that ban a strategy.
    pub ban_threshold: u32,
    /// End the episode when a forbidden strategy resubmits source already
    /// known to fail.
    pub stop_on_repeated_dead_end: bool,
}

impl Default for EpisodeParams {
    fn default() -> Self {
        Self {
            max_loops: 5,
            ban_threshold: 2,
            stop_on_repeated_dead_end: true,
        }
    }
}

impl EpisodeParams {
    pub fn validate(&self) -> Result<(), CmvkError> {
        if self.max_loops < 1 {
            return Err(CmvkError::InvalidConfig("max_loops must be at least 1".into()));
        }
        if self.ban_threshold < 1 {
            return Err(CmvkError::InvalidConfig("ban_threshold must be at least 1".into()));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Episode
// ─────────────────────────────────────────────────────────────────────────────

/// What happens after an attempt has been settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accepted,
    Continue,
    Exhausted,
}

/// Result of [`Episode::admit`].
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// The candidate is new and allowed; hand it to the Verifier.
    Verify(Candidate),
    /// The attempt was settled without the Verifier (cache hit, forbidden
    /// strategy or empty proposal).
    Settled(Decision),
}

pub struct Episode {
    id: Uuid,
    task: Task,
    params: EpisodeParams,
    fingerprinter: Fingerprinter,
    graph: GraphOfTruth,
    policy: BanPolicy,
    attempts: Vec<Attempt>,
    state: EpisodeState,
    last_feedback: Option<Verdict>,
}

impl Episode {
    pub fn new(task: Task, params: EpisodeParams, fingerprinter: Fingerprinter) -> Result<Self, CmvkError> {
        params.validate()?;
        Ok(Self {
            id: Uuid::new_v4(),
            task,
            params,
            fingerprinter,
            graph: GraphOfTruth::new(),
            policy: BanPolicy::new(params.ban_threshold),
            attempts: Vec::new(),
            state: EpisodeState::Init,
            last_feedback: None,
        })
    }

    /// Start from an existing Graph of Truth instead of an empty one.
    pub fn with_graph(mut self, graph: GraphOfTruth) -> Self {
        self.graph = graph;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn params(&self) -> EpisodeParams {
        self.params
    }

    pub fn state(&self) -> EpisodeState {
        self.state
    }

    pub fn graph(&self) -> &GraphOfTruth {
        &self.graph
    }

    pub fn policy(&self) -> &BanPolicy {
        &self.policy
    }

    pub fn forbidden(&self) -> &BTreeSet<StrategyTag> {
        self.policy.forbidden()
    }

    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn attempts_used(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    /// Verdict of the previous attempt, passed to the Generator as feedback.
    pub fn last_feedback(&self) -> Option<&Verdict> {
        self.last_feedback.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// Begin a new attempt.  Returns its 1-based index.
    pub fn start_attempt(&mut self) -> Result<u32, CmvkError> {
        self.transition(EpisodeState::Generating)?;
        let index = self.attempts_used() + 1;
        debug!(episode = %self.id, attempt = index, "attempt started");
        Ok(index)
    }

    /// Settle the current attempt as a Generator failure.
    ///
    /// Nothing is cached and no strategy counter moves.
    pub fn generation_failed(&mut self, reason: &str) -> Result<Decision, CmvkError> {
        self.require(EpisodeState::Generating)?;
        warn!(episode = %self.id, reason, "generator failed");
        let attempt = Attempt {
            index: self.attempts_used() + 1,
            candidate: None,
            verdict: Verdict::synthetic_failure(IssueKind::GenerationFailure, reason),
            cache_hit: false,
            ban_triggered: false,
        };
        self.conclude(attempt, false)
    }

    /// Classify and fingerprint `proposal`, then settle the attempt from the
    /// ban policy or the Graph of Truth when possible.
    pub fn admit(
        &mut self,
        proposal: Proposal,
        classifier: &dyn StrategyClassifier,
    ) -> Result<Admission, CmvkError> {
        self.require(EpisodeState::Generating)?;
        if proposal.source.trim().is_empty() {
            return self
                .generation_failed("generator returned empty source")
                .map(Admission::Settled);
        }

        self.transition(EpisodeState::Classifying)?;
        let strategy = classifier.classify(&proposal.source);
        let fingerprint = self.fingerprinter.fingerprint(&proposal.source);
        let candidate = Candidate {
            source: proposal.source,
            strategy,
            fingerprint,
        };
        let index = self.attempts_used() + 1;

        if self.policy.is_forbidden(&candidate.strategy) {
            let dead_end = self.params.stop_on_repeated_dead_end
                && self.graph.is_known_failure(&candidate.fingerprint);
            warn!(
                episode = %self.id,
                attempt = index,
                strategy = %candidate.strategy,
                dead_end,
                "forbidden strategy proposed"
            );
            let verdict = Verdict::synthetic_failure(
                IssueKind::ForbiddenStrategyViolation,
                format!("strategy '{}' is forbidden in this episode", candidate.strategy),
            );
            let attempt = Attempt {
                index,
                candidate: Some(candidate),
                verdict,
                cache_hit: false,
                ban_triggered: false,
            };
            return self.conclude(attempt, dead_end).map(Admission::Settled);
        }

        self.transition(EpisodeState::CacheLookup)?;
        if let Some(cached) = self.graph.lookup(&candidate.fingerprint).cloned() {
            debug!(
                episode = %self.id,
                attempt = index,
                fingerprint = %candidate.fingerprint.short(),
                "graph of truth hit"
            );
            let attempt = Attempt {
                index,
                candidate: Some(candidate),
                verdict: cached,
                cache_hit: true,
                ban_triggered: false,
            };
            return self.conclude(attempt, false).map(Admission::Settled);
        }

        self.transition(EpisodeState::Verifying)?;
        Ok(Admission::Verify(candidate))
    }

    /// Settle the current attempt with the Verifier's answer.
    ///
    /// A Verifier error becomes a `VerifierUnavailable` failure that is
    /// neither cached nor counted against the strategy.
    ///
    /// # Errors
    ///
    /// [`CmvkError::DuplicateFingerprintConflict`] when the graph already
    /// holds a different verdict for the candidate.
    pub fn complete_verification(
        &mut self,
        candidate: Candidate,
        outcome: Result<Verdict, CmvkError>,
    ) -> Result<Decision, CmvkError> {
        self.require(EpisodeState::Verifying)?;
        let (verdict, ban_triggered) = match outcome {
            Ok(verdict) => {
                self.graph.record(candidate.fingerprint.clone(), verdict.clone())?;
                let banned = !verdict.is_pass() && self.policy.record_failure(&candidate.strategy);
                (verdict, banned)
            }
            Err(e) => {
                warn!(episode = %self.id, error = %e, "verifier unavailable");
                (
                    Verdict::synthetic_failure(IssueKind::VerifierUnavailable, e.to_string()),
                    false,
                )
            }
        };
        let attempt = Attempt {
            index: self.attempts_used() + 1,
            candidate: Some(candidate),
            verdict,
            cache_hit: false,
            ban_triggered,
        };
        self.conclude(attempt, false)
    }

    /// Terminate without further attempts (deadline reached, shutdown).
    ///
    /// Only valid between attempts.
    pub fn exhaust_early(&mut self, reason: &str) -> Result<(), CmvkError> {
        info!(episode = %self.id, attempts = self.attempts_used(), reason, "episode ended early");
        self.transition(EpisodeState::Exhausted)
    }

    /// Trace record for the most recent attempt.
    pub fn last_attempt_event(&self) -> Option<TraceEvent> {
        self.last_attempt().map(|attempt| {
            TraceEvent::Attempt(AttemptRecord::new(self.id, attempt, self.policy.forbidden()))
        })
    }

    /// Terminal trace record; `None` until the episode has finished.
    pub fn terminal_event(&self) -> Option<TraceEvent> {
        let outcome = self.outcome()?;
        Some(TraceEvent::Terminal(TerminalRecord::new(
            self.id,
            outcome,
            self.attempts_used(),
            self.policy.forbidden(),
        )))
    }

    /// Move the Graph of Truth out, leaving an empty one behind.  Used to
    /// hand a shared graph back to its owner even when the episode aborted.
    pub fn take_graph(&mut self) -> GraphOfTruth {
        std::mem::take(&mut self.graph)
    }

    /// Consume a finished episode.  The Graph of Truth is handed back so it
    /// can outlive the episode.
    pub fn finish(self) -> Result<(EpisodeResult, GraphOfTruth), CmvkError> {
        let outcome = self.outcome().ok_or_else(|| CmvkError::IllegalTransition {
            from: self.state.to_string(),
            to: "FINISHED".into(),
        })?;
        let accepted_candidate = match outcome {
            EpisodeOutcome::Accepted => self.attempts.last().and_then(|a| a.candidate.clone()),
            EpisodeOutcome::Exhausted => None,
        };
        let result = EpisodeResult {
            episode_id: self.id,
            outcome,
            accepted_candidate,
            attempts: self.attempts,
            forbidden_strategies: self.policy.forbidden().clone(),
        };
        Ok((result, self.graph))
    }

    fn outcome(&self) -> Option<EpisodeOutcome> {
        match self.state {
            EpisodeState::Accepted => Some(EpisodeOutcome::Accepted),
            EpisodeState::Exhausted => Some(EpisodeOutcome::Exhausted),
            _ => None,
        }
    }

    fn conclude(&mut self, attempt: Attempt, dead_end: bool) -> Result<Decision, CmvkError> {
        self.transition(EpisodeState::Deciding)?;
        let used = self.attempts_used() + 1;
        let decision = if attempt.verdict.is_pass() {
            Decision::Accepted
        } else if dead_end {
            info!(episode = %self.id, attempt = used, "repeated dead end");
            Decision::Exhausted
        } else if used >= self.params.max_loops {
            Decision::Exhausted
        } else {
            Decision::Continue
        };

        self.last_feedback = Some(attempt.verdict.clone());
        self.attempts.push(attempt);

        match decision {
            Decision::Accepted => self.transition(EpisodeState::Accepted)?,
            Decision::Exhausted => self.transition(EpisodeState::Exhausted)?,
            Decision::Continue => {}
        }
        Ok(decision)
    }

    fn require(&self, expected: EpisodeState) -> Result<(), CmvkError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(CmvkError::IllegalTransition {
                from: self.state.to_string(),
                to: expected.to_string(),
            })
        }
    }

    fn transition(&mut self, to: EpisodeState) -> Result<(), CmvkError> {
        validate_transition(self.state, to)?;
        self.state = to;
        Ok(())
    }
}
