//! [`Arbiter`] – the verification loop.
//!
//! Drives one [`Episode`] per task.  Each attempt:
//!
//! 1. **Generate** – call the [`Generator`] with the task, the forbidden
//!    strategies and the previous verdict, under `generator_timeout`.
//! 2. **Classify** – tag and fingerprint the proposal.
//! 3. **Police** – a forbidden strategy is rejected without a Verifier call.
//! 4. **Recall** – a fingerprint already in the Graph of Truth reuses its
//!    verdict.
//! 5. **Verify** – otherwise call the [`Verifier`] under `verifier_timeout`
//!    and record the verdict.
//! 6. **Decide** – accept, retry with feedback, or give up.
//!
//! Steps 2–6 live in `cmvk-kernel`; this module owns the I/O, the timeouts,
//! the episode deadline and trace emission.  Every attempt consumes one slot of
//! `max_loops`, whatever went wrong, so an episode always ends.
//!
//! Generator and Verifier failures never surface as errors: they become FAIL
//! attempts.  The only error an episode returns after starting is
//! [`CmvkError::DuplicateFingerprintConflict`].
//!
//! # Example
//!
//! ```rust,no_run
//! use cmvk_runtime::arbiter::{Arbiter, ArbiterConfig};
//! use cmvk_runtime::collaborators::{NullGenerator, NullVerifier};
//! use cmvk_types::Task;
//!
//! # async fn demo() -> Result<(), cmvk_types::CmvkError> {
//! let arbiter = Arbiter::new(NullGenerator, NullVerifier, ArbiterConfig::default())?;
//! let result = arbiter.run_episode(Task::new("p1", "Merge two sorted lists")).await?;
//! println!("{:?} after {} attempts", result.outcome, result.attempts.len());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use cmvk_kernel::{
    Admission, Decision, Episode, EpisodeParams, FingerprintMode, Fingerprinter, GraphOfTruth,
    RuleClassifier, StrategyClassifier,
};
use cmvk_memory::{NullRecorder, TraceRecorder};
use std::collections::BTreeSet;

use cmvk_types::{
    BaselineResult, Candidate, CmvkError, EpisodeResult, IssueKind, Task, TraceEvent, Verdict,
};
use tokio::time::{Instant, timeout};
use tracing::{Instrument, info, info_span, warn};

use crate::collaborators::{Generator, Verifier};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration bundle for [`Arbiter`].
#[derive(Debug, Clone, PartialEq)]
pub struct ArbiterConfig {
    /// Hard cap on attempts per episode.
    pub max_loops: u32,
    /// Organic failures that ban a strategy.
    pub ban_threshold: u32,
    pub generator_timeout: Duration,
    pub verifier_timeout: Duration,
    /// Wall-clock budget for a whole episode.  `None` means attempts are
    /// only bounded by `max_loops`.
    pub episode_deadline: Option<Duration>,
    pub fingerprint_mode: FingerprintMode,
    /// End the episode when a banned strategy resubmits known-bad source.
    pub stop_on_repeated_dead_end: bool,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            max_loops: 5,
            ban_threshold: 2,
            generator_timeout: Duration::from_secs(60),
            verifier_timeout: Duration::from_secs(60),
            episode_deadline: None,
            fingerprint_mode: FingerprintMode::Exact,
            stop_on_repeated_dead_end: true,
        }
    }
}

impl ArbiterConfig {
    pub fn validate(&self) -> Result<(), CmvkError> {
        self.params().validate()?;
        if self.generator_timeout.is_zero() || self.verifier_timeout.is_zero() {
            return Err(CmvkError::InvalidConfig("call timeouts must be non-zero".into()));
        }
        if self.episode_deadline.is_some_and(|d| d.is_zero()) {
            return Err(CmvkError::InvalidConfig("episode deadline must be non-zero".into()));
        }
        Ok(())
    }

    pub fn params(&self) -> EpisodeParams {
        EpisodeParams {
            max_loops: self.max_loops,
            ban_threshold: self.ban_threshold,
            stop_on_repeated_dead_end: self.stop_on_repeated_dead_end,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Arbiter
// ─────────────────────────────────────────────────────────────────────────────

/// Sequences Generator and Verifier calls for one episode at a time.
///
/// An `Arbiter` holds no per-episode state, so one instance can run many
/// episodes concurrently (see [`BatchRunner`][crate::batch::BatchRunner]).
pub struct Arbiter {
    generator: Arc<dyn Generator>,
    verifier: Arc<dyn Verifier>,
    classifier: Arc<dyn StrategyClassifier>,
    recorder: Arc<dyn TraceRecorder>,
    config: ArbiterConfig,
}

impl Arbiter {
    /// # Errors
    ///
    /// [`CmvkError::InvalidConfig`] when `config` fails validation.
    pub fn new(
        generator: impl Generator + 'static,
        verifier: impl Verifier + 'static,
        config: ArbiterConfig,
    ) -> Result<Self, CmvkError> {
        config.validate()?;
        Ok(Self {
            generator: Arc::new(generator),
            verifier: Arc::new(verifier),
            classifier: Arc::new(RuleClassifier::default()),
            recorder: Arc::new(NullRecorder),
            config,
        })
    }

    /// Replace the built-in [`RuleClassifier`].
    pub fn with_classifier(mut self, classifier: impl StrategyClassifier + 'static) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn with_recorder(mut self, recorder: impl TraceRecorder + 'static) -> Self {
        self.recorder = Arc::new(recorder);
        self
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    /// Run one episode with the configured bounds and a fresh Graph of Truth.
    pub async fn run_episode(&self, task: Task) -> Result<EpisodeResult, CmvkError> {
        self.run_episode_with(task, self.config.max_loops, self.config.ban_threshold)
            .await
    }

    /// Run one episode overriding `max_loops` and `ban_threshold`.
    ///
    /// # Errors
    ///
    /// [`CmvkError::InvalidConfig`] when either bound is zero.
    pub async fn run_episode_with(
        &self,
        task: Task,
        max_loops: u32,
        ban_threshold: u32,
    ) -> Result<EpisodeResult, CmvkError> {
        let params = EpisodeParams {
            max_loops,
            ban_threshold,
            ..self.config.params()
        };
        let fingerprinter = Fingerprinter::new(self.config.fingerprint_mode);
        let mut episode = Episode::new(task, params, fingerprinter)?;
        self.drive(&mut episode).await?;
        episode.finish().map(|(result, _)| result)
    }

    /// Run one episode against a caller-owned Graph of Truth so verdicts carry
    /// over between tasks.  Fingerprints are scoped to the task id.  The graph
    /// is handed back even when the episode aborts.
    pub async fn run_episode_in(
        &self,
        task: Task,
        graph: &mut GraphOfTruth,
    ) -> Result<EpisodeResult, CmvkError> {
        let fingerprinter = Fingerprinter::new(self.config.fingerprint_mode).scoped_to(task.id.clone());
        let mut episode =
            Episode::new(task, self.config.params(), fingerprinter)?.with_graph(std::mem::take(graph));
        let run = self.drive(&mut episode).await;
        *graph = episode.take_graph();
        run?;
        episode.finish().map(|(result, _)| result)
    }

    /// Control arm: one Generator call with no forbidden strategies and no
    /// feedback, judged once by the Verifier when `judge` is set.  Nothing is
    /// cached or traced.
    pub async fn run_baseline(&self, task: Task, judge: bool) -> BaselineResult {
        let span = info_span!("baseline", task = %task.id);
        async {
            let limit = self.config.generator_timeout;
            let generated = timeout(limit, self.generator.generate(&task, &BTreeSet::new(), None)).await;
            let proposal = match generated {
                Ok(Ok(proposal)) if !proposal.source.trim().is_empty() => proposal,
                Ok(Ok(_)) => return BaselineResult::generation_failed("generator returned empty source"),
                Ok(Err(e)) => return BaselineResult::generation_failed(e.to_string()),
                Err(_) => {
                    return BaselineResult::generation_failed(format!("generator timed out after {limit:?}"));
                }
            };

            let strategy = self.classifier.classify(&proposal.source);
            let fingerprint = Fingerprinter::new(self.config.fingerprint_mode).fingerprint(&proposal.source);
            let candidate = Candidate {
                source: proposal.source,
                strategy,
                fingerprint,
            };

            let verdict = if judge {
                let limit = self.config.verifier_timeout;
                Some(match timeout(limit, self.verifier.verify(&candidate, &task)).await {
                    Ok(Ok(verdict)) => verdict,
                    Ok(Err(e)) => Verdict::synthetic_failure(IssueKind::VerifierUnavailable, e.to_string()),
                    Err(_) => Verdict::synthetic_failure(
                        IssueKind::VerifierUnavailable,
                        format!("verifier timed out after {limit:?}"),
                    ),
                })
            } else {
                None
            };
            info!(
                strategy = %candidate.strategy,
                judged = judge,
                passed = verdict.as_ref().is_some_and(Verdict::is_pass),
                "baseline finished"
            );
            BaselineResult {
                candidate: Some(candidate),
                verdict,
            }
        }
        .instrument(span)
        .await
    }

    // -------------------------------------------------------------------------
    // Loop
    // -------------------------------------------------------------------------

    async fn drive(&self, episode: &mut Episode) -> Result<(), CmvkError> {
        let span = info_span!("episode", episode_id = %episode.id(), task = %episode.task().id);
        async {
            let started = Instant::now();
            loop {
                if let Some(deadline) = self.config.episode_deadline
                    && started.elapsed() >= deadline
                {
                    episode.exhaust_early("episode deadline reached")?;
                    break;
                }

                let index = episode.start_attempt()?;
                let decision = self.attempt(episode, started).await?;
                self.emit(episode.last_attempt_event());

                if let Some(last) = episode.last_attempt() {
                    info!(
                        attempt = index,
                        strategy = last.strategy().map(|s| s.as_str()).unwrap_or("-"),
                        status = ?last.verdict.status,
                        cache_hit = last.cache_hit,
                        ban_triggered = last.ban_triggered,
                        "attempt settled"
                    );
                }
                if decision != Decision::Continue {
                    break;
                }
            }
            self.emit(episode.terminal_event());
            info!(
                state = %episode.state(),
                attempts = episode.attempts_used(),
                forbidden = episode.forbidden().len(),
                "episode finished"
            );
            Ok::<(), CmvkError>(())
        }
        .instrument(span)
        .await
    }

    /// Run one attempt; the episode is in `GENERATING` on entry and settled
    /// on return.
    async fn attempt(&self, episode: &mut Episode, started: Instant) -> Result<Decision, CmvkError> {
        let forbidden = episode.forbidden().clone();
        let feedback = episode.last_feedback().cloned();

        let limit = self.budget(self.config.generator_timeout, started);
        let generated = timeout(
            limit,
            self.generator.generate(episode.task(), &forbidden, feedback.as_ref()),
        )
        .await;
        let proposal = match generated {
            Ok(Ok(proposal)) => proposal,
            Ok(Err(e)) => return episode.generation_failed(&e.to_string()),
            Err(_) => {
                return episode.generation_failed(&format!("generator timed out after {limit:?}"));
            }
        };

        let candidate = match episode.admit(proposal, self.classifier.as_ref())? {
            Admission::Settled(decision) => return Ok(decision),
            Admission::Verify(candidate) => candidate,
        };

        let limit = self.budget(self.config.verifier_timeout, started);
        let outcome = match timeout(limit, self.verifier.verify(&candidate, episode.task())).await {
            Ok(outcome) => outcome,
            Err(_) => Err(CmvkError::VerificationFailure(format!(
                "verifier timed out after {limit:?}"
            ))),
        };
        episode.complete_verification(candidate, outcome)
    }

    /// Per-call timeout, capped by what is left of the episode deadline.
    fn budget(&self, call_limit: Duration, started: Instant) -> Duration {
        match self.config.episode_deadline {
            Some(deadline) => call_limit.min(deadline.saturating_sub(started.elapsed())),
            None => call_limit,
        }
    }

    fn emit(&self, event: Option<TraceEvent>) {
        if let Some(event) = event
            && let Err(e) = self.recorder.record(&event)
        {
            warn!(error = %e, "trace recorder failed; continuing");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{NullGenerator, NullVerifier};
    use async_trait::async_trait;
    use cmvk_memory::{MemoryRecorder, TraceError};
    use cmvk_types::{
        Candidate, EpisodeOutcome, Issue, IssueKind, Proposal, Severity, StrategyTag, Verdict,
    };
    use std::collections::BTreeSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ── Scripted collaborators ───────────────────────────────────────────────

    enum Step {
        Source(String),
        Fail(&'static str),
        Hang,
    }

    type GenScript = Box<dyn Fn(usize) -> Step + Send + Sync>;

    /// Generator whose n-th call (0-based) is answered by a script.  Records
    /// what it was shown.
    struct ScriptedGenerator {
        script: GenScript,
        calls: AtomicUsize,
        seen_forbidden: Mutex<Vec<BTreeSet<StrategyTag>>>,
        seen_feedback: Mutex<Vec<Option<Verdict>>>,
    }

    impl ScriptedGenerator {
        fn new(script: impl Fn(usize) -> Step + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                script: Box::new(script),
                calls: AtomicUsize::new(0),
                seen_forbidden: Mutex::new(Vec::new()),
                seen_feedback: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate(
            &self,
            _task: &Task,
            forbidden: &BTreeSet<StrategyTag>,
            feedback: Option<&Verdict>,
        ) -> Result<Proposal, CmvkError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_forbidden.lock().unwrap().push(forbidden.clone());
            self.seen_feedback.lock().unwrap().push(feedback.cloned());
            match (self.script)(n) {
                Step::Source(s) => Ok(Proposal::new(s)),
                Step::Fail(reason) => Err(CmvkError::GenerationFailure(reason.into())),
                Step::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(CmvkError::GenerationFailure("unreachable".into()))
                }
            }
        }
    }

    type VerScript = Box<dyn Fn(&Candidate) -> Option<Verdict> + Send + Sync>;

    /// Verifier answering from a script; `None` means "hang".
    struct ScriptedVerifier {
        script: VerScript,
        calls: AtomicUsize,
    }

    impl ScriptedVerifier {
        fn new(script: impl Fn(&Candidate) -> Option<Verdict> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                script: Box::new(script),
                calls: AtomicUsize::new(0),
            })
        }

        fn always_fail() -> Arc<Self> {
            Self::new(|_| Some(failing()))
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Verifier for ScriptedVerifier {
        async fn verify(&self, candidate: &Candidate, _task: &Task) -> Result<Verdict, CmvkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match (self.script)(candidate) {
                Some(v) => Ok(v),
                None => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(CmvkError::VerificationFailure("unreachable".into()))
                }
            }
        }
    }

    struct BrokenRecorder;

    impl TraceRecorder for BrokenRecorder {
        fn record(&self, _event: &TraceEvent) -> Result<(), TraceError> {
            Err(TraceError::Poisoned)
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    const SORTED: &str = "def merge(a, b):\n    return sorted(a + b)";
    const LOOP: &str = "def merge(a, b):\n    out = []\n    while a and b:\n        out.append(a.pop(0))\n    return out";

    fn failing() -> Verdict {
        Verdict::fail(vec![Issue::defect(Severity::High, "wrong order")], 0.9)
    }

    fn task() -> Task {
        Task::new("merge", "Merge two sorted lists")
    }

    fn config(max_loops: u32, ban_threshold: u32) -> ArbiterConfig {
        ArbiterConfig {
            max_loops,
            ban_threshold,
            generator_timeout: Duration::from_millis(200),
            verifier_timeout: Duration::from_millis(200),
            ..ArbiterConfig::default()
        }
    }

    fn arbiter(
        generator: &Arc<ScriptedGenerator>,
        verifier: &Arc<ScriptedVerifier>,
        config: ArbiterConfig,
    ) -> Arbiter {
        Arbiter::new(generator.clone(), verifier.clone(), config).unwrap()
    }

    fn is_violation(v: &Verdict) -> bool {
        v.has_issue(IssueKind::ForbiddenStrategyViolation)
    }

    // ── Scenarios ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn persistent_banned_strategy_exhausts_the_budget() {
        let generator = ScriptedGenerator::new(|n| Step::Source(format!("{SORTED}  # variant {n}")));
        let verifier = ScriptedVerifier::always_fail();
        let result = arbiter(&generator, &verifier, config(5, 2))
            .run_episode(task())
            .await
            .unwrap();

        assert_eq!(result.outcome, EpisodeOutcome::Exhausted);
        assert_eq!(result.attempts.len(), 5);
        assert!(!is_violation(&result.attempts[0].verdict));
        assert!(!is_violation(&result.attempts[1].verdict));
        assert!(!result.attempts[0].ban_triggered);
        assert!(result.attempts[1].ban_triggered);
        assert!(result.attempts[2..].iter().all(|a| is_violation(&a.verdict)));
        assert_eq!(verifier.calls(), 2);
        assert!(result.forbidden_strategies.contains(&StrategyTag::new("built-in-sort")));

        let seen = generator.seen_forbidden.lock().unwrap();
        assert!(seen[1].is_empty());
        assert!(seen[2].contains(&StrategyTag::new("built-in-sort")));
    }

    #[tokio::test]
    async fn identical_resubmission_is_a_cache_hit() {
        let generator = ScriptedGenerator::new(|n| match n {
            0 | 1 => Step::Source(LOOP.into()),
            _ => Step::Source(SORTED.into()),
        });
        let verifier = ScriptedVerifier::new(|c| {
            Some(if c.source == LOOP { failing() } else { Verdict::pass(0.95) })
        });
        let result = arbiter(&generator, &verifier, config(3, 2))
            .run_episode(task())
            .await
            .unwrap();

        assert_eq!(result.outcome, EpisodeOutcome::Accepted);
        assert_eq!(result.attempts.len(), 3);
        assert_eq!(result.cache_hits(), 1);
        assert!(result.attempts[1].cache_hit);
        assert_eq!(result.attempts[1].verdict, result.attempts[0].verdict);
        assert_eq!(verifier.calls(), 2);
        assert!(result.forbidden_strategies.is_empty());
        assert_eq!(result.accepted_candidate.unwrap().source, SORTED);
    }

    #[tokio::test]
    async fn generator_timeout_on_single_loop_exhausts() {
        let generator = ScriptedGenerator::new(|_| Step::Hang);
        let verifier = ScriptedVerifier::always_fail();
        let cfg = ArbiterConfig {
            generator_timeout: Duration::from_millis(50),
            ..config(1, 2)
        };
        let result = arbiter(&generator, &verifier, cfg).run_episode(task()).await.unwrap();

        assert_eq!(result.outcome, EpisodeOutcome::Exhausted);
        assert_eq!(result.attempts.len(), 1);
        let attempt = &result.attempts[0];
        assert!(attempt.verdict.has_issue(IssueKind::GenerationFailure));
        assert!(attempt.candidate.is_none());
        assert!(attempt.strategy().is_none());
        assert_eq!(verifier.calls(), 0);
    }

    #[tokio::test]
    async fn threshold_one_single_strategy_ends_after_two_attempts() {
        let generator = ScriptedGenerator::new(|_| Step::Source(SORTED.into()));
        let verifier = ScriptedVerifier::always_fail();
        let result = arbiter(&generator, &verifier, config(10, 1))
            .run_episode(task())
            .await
            .unwrap();

        assert_eq!(result.outcome, EpisodeOutcome::Exhausted);
        assert_eq!(result.attempts.len(), 2);
        assert!(result.attempts[0].ban_triggered);
        assert!(is_violation(&result.attempts[1].verdict));
        assert_eq!(verifier.calls(), 1);
    }

    // ── Properties ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn termination_is_bounded_by_max_loops() {
        for k in 1..=6 {
            let generator = ScriptedGenerator::new(|_| Step::Fail("malformed output"));
            let verifier = ScriptedVerifier::always_fail();
            let result = arbiter(&generator, &verifier, config(k, 2))
                .run_episode(task())
                .await
                .unwrap();
            assert_eq!(result.attempts.len() as u32, k);
            assert_eq!(generator.calls() as u32, k);
        }
    }

    #[tokio::test]
    async fn forbidden_set_only_grows() {
        let generator = ScriptedGenerator::new(|n| {
            let sources = [SORTED, LOOP, "import heapq\nheapq.merge(a, b)"];
            Step::Source(format!("{}\n# {n}", sources[n % 3]))
        });
        let verifier = ScriptedVerifier::always_fail();
        let recorder = Arc::new(MemoryRecorder::new());
        let result = arbiter(&generator, &verifier, config(9, 2))
            .with_recorder(recorder.clone())
            .run_episode(task())
            .await
            .unwrap();
        assert_eq!(result.attempts.len(), 9);

        let mut previous: Vec<StrategyTag> = Vec::new();
        for event in recorder.for_episode(result.episode_id) {
            if let TraceEvent::Attempt(record) = event {
                assert!(previous.iter().all(|t| record.forbidden_strategies_after.contains(t)));
                previous = record.forbidden_strategies_after;
            }
        }
        assert_eq!(previous.len(), 3);
    }

    #[tokio::test]
    async fn one_organic_failure_does_not_ban_at_threshold_two() {
        let generator = ScriptedGenerator::new(|n| match n {
            0 => Step::Source(LOOP.into()),
            _ => Step::Source(SORTED.into()),
        });
        let verifier = ScriptedVerifier::new(|c| {
            Some(if c.source == LOOP { failing() } else { Verdict::pass(1.0) })
        });
        let result = arbiter(&generator, &verifier, config(5, 2))
            .run_episode(task())
            .await
            .unwrap();
        assert!(result.is_accepted());
        assert!(result.forbidden_strategies.is_empty());
        assert!(generator.seen_forbidden.lock().unwrap().iter().all(|s| s.is_empty()));
    }

    #[tokio::test]
    async fn trace_mirrors_attempts_in_order() {
        let generator = ScriptedGenerator::new(|n| match n {
            0 => Step::Fail("empty"),
            1 | 2 => Step::Source(LOOP.into()),
            _ => Step::Source(SORTED.into()),
        });
        let verifier = ScriptedVerifier::new(|c| {
            Some(if c.source == LOOP { failing() } else { Verdict::pass(1.0) })
        });
        let recorder = Arc::new(MemoryRecorder::new());
        let result = arbiter(&generator, &verifier, config(5, 2))
            .with_recorder(recorder.clone())
            .run_episode(task())
            .await
            .unwrap();

        let events = recorder.for_episode(result.episode_id);
        assert_eq!(events.len(), result.attempts.len() + 1);
        for (event, attempt) in events.iter().zip(&result.attempts) {
            match event {
                TraceEvent::Attempt(record) => {
                    assert_eq!(record.attempt_index, attempt.index);
                    assert_eq!(record.cache_hit, attempt.cache_hit);
                    assert_eq!(record.verdict_status, attempt.verdict.status);
                }
                other => panic!("expected attempt record, got {other:?}"),
            }
        }
        match events.last() {
            Some(TraceEvent::Terminal(t)) => {
                assert_eq!(t.outcome, EpisodeOutcome::Accepted);
                assert_eq!(t.total_attempts, 4);
            }
            other => panic!("expected terminal record, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn feedback_reaches_the_generator() {
        let generator = ScriptedGenerator::new(|n| Step::Source(format!("{LOOP}\n# {n}")));
        let verifier = ScriptedVerifier::always_fail();
        arbiter(&generator, &verifier, config(2, 5))
            .run_episode(task())
            .await
            .unwrap();
        let feedback = generator.seen_feedback.lock().unwrap();
        assert!(feedback[0].is_none());
        assert_eq!(feedback[1].as_ref(), Some(&failing()));
    }

    // ── Failure handling ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn verifier_timeout_is_not_cached_or_counted() {
        let verifier_calls = Arc::new(AtomicUsize::new(0));
        let counter = verifier_calls.clone();
        let generator = ScriptedGenerator::new(|_| Step::Source(LOOP.into()));
        let verifier = ScriptedVerifier::new(move |_| {
            // first call hangs, later calls pass
            if counter.fetch_add(1, Ordering::SeqCst) == 0 { None } else { Some(Verdict::pass(1.0)) }
        });
        let result = arbiter(&generator, &verifier, config(3, 1))
            .run_episode(task())
            .await
            .unwrap();

        assert!(result.is_accepted());
        assert_eq!(result.attempts.len(), 2);
        assert!(result.attempts[0].verdict.has_issue(IssueKind::VerifierUnavailable));
        assert!(!result.attempts[1].cache_hit);
        assert!(result.forbidden_strategies.is_empty());
        assert_eq!(verifier.calls(), 2);
    }

    #[tokio::test]
    async fn empty_proposal_is_a_generation_failure() {
        let generator = ScriptedGenerator::new(|_| Step::Source("   ".into()));
        let verifier = ScriptedVerifier::always_fail();
        let result = arbiter(&generator, &verifier, config(2, 1))
            .run_episode(task())
            .await
            .unwrap();
        assert!(result.attempts.iter().all(|a| a.verdict.has_issue(IssueKind::GenerationFailure)));
        assert_eq!(verifier.calls(), 0);
    }

    #[tokio::test]
    async fn broken_recorder_does_not_change_outcome() {
        let generator = ScriptedGenerator::new(|_| Step::Source(SORTED.into()));
        let verifier = ScriptedVerifier::new(|_| Some(Verdict::pass(1.0)));
        let result = arbiter(&generator, &verifier, config(3, 2))
            .with_recorder(BrokenRecorder)
            .run_episode(task())
            .await
            .unwrap();
        assert!(result.is_accepted());
    }

    #[tokio::test]
    async fn episode_deadline_forces_early_exhaustion() {
        let generator = ScriptedGenerator::new(|_| Step::Hang);
        let verifier = ScriptedVerifier::always_fail();
        let cfg = ArbiterConfig {
            episode_deadline: Some(Duration::from_millis(120)),
            generator_timeout: Duration::from_millis(50),
            ..config(100, 2)
        };
        let result = arbiter(&generator, &verifier, cfg).run_episode(task()).await.unwrap();
        assert_eq!(result.outcome, EpisodeOutcome::Exhausted);
        assert!(result.attempts.len() < 100);
        assert!(!result.attempts.is_empty());
    }

    // ── Configuration and entry points ───────────────────────────────────────

    #[test]
    fn invalid_config_is_rejected() {
        let zero_loops = ArbiterConfig {
            max_loops: 0,
            ..ArbiterConfig::default()
        };
        assert!(matches!(zero_loops.validate(), Err(CmvkError::InvalidConfig(_))));
        let zero_timeout = ArbiterConfig {
            verifier_timeout: Duration::ZERO,
            ..ArbiterConfig::default()
        };
        assert!(Arbiter::new(NullGenerator, NullVerifier, zero_timeout).is_err());
        assert!(ArbiterConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn run_episode_with_rejects_zero_threshold() {
        let arbiter = Arbiter::new(NullGenerator, NullVerifier, ArbiterConfig::default()).unwrap();
        let err = arbiter.run_episode_with(task(), 3, 0).await.unwrap_err();
        assert!(matches!(err, CmvkError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn null_collaborators_accept_immediately() {
        let arbiter = Arbiter::new(NullGenerator, NullVerifier, ArbiterConfig::default()).unwrap();
        let result = arbiter.run_episode(task()).await.unwrap();
        assert!(result.is_accepted());
        assert_eq!(result.attempts.len(), 1);
    }

    #[tokio::test]
    async fn shared_graph_caches_per_task() {
        let generator = ScriptedGenerator::new(|_| Step::Source(LOOP.into()));
        let verifier = ScriptedVerifier::always_fail();
        let arbiter = arbiter(&generator, &verifier, config(1, 2));
        let mut graph = GraphOfTruth::new();

        arbiter.run_episode_in(task(), &mut graph).await.unwrap();
        assert_eq!(graph.len(), 1);

        // same task again: answered from the shared graph
        let again = arbiter.run_episode_in(task(), &mut graph).await.unwrap();
        assert!(again.attempts[0].cache_hit);
        assert_eq!(verifier.calls(), 1);

        // same source, different task: scoped fingerprint, verified afresh
        let other = Task::new("other", "Something else");
        let fresh = arbiter.run_episode_in(other, &mut graph).await.unwrap();
        assert!(!fresh.attempts[0].cache_hit);
        assert_eq!(verifier.calls(), 2);
        assert_eq!(graph.len(), 2);
    }

    // ── Baseline ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn baseline_generates_once_and_judges_once() {
        let generator = ScriptedGenerator::new(|_| Step::Source(LOOP.into()));
        let verifier = ScriptedVerifier::always_fail();
        let recorder = Arc::new(MemoryRecorder::new());
        let arbiter = arbiter(&generator, &verifier, config(5, 2)).with_recorder(recorder.clone());

        let result = arbiter.run_baseline(task(), true).await;
        assert_eq!(generator.calls(), 1);
        assert_eq!(verifier.calls(), 1);
        assert!(result.is_judged());
        assert!(!result.is_accepted());
        assert!(generator.seen_forbidden.lock().unwrap()[0].is_empty());
        assert!(generator.seen_feedback.lock().unwrap()[0].is_none());
        assert_eq!(result.candidate.unwrap().strategy.as_str(), "iterative");
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn unjudged_baseline_skips_the_verifier() {
        let generator = ScriptedGenerator::new(|_| Step::Source(LOOP.into()));
        let verifier = ScriptedVerifier::new(|_| Some(Verdict::pass(1.0)));
        let result = arbiter(&generator, &verifier, config(5, 2))
            .run_baseline(task(), false)
            .await;
        assert_eq!(verifier.calls(), 0);
        assert!(result.candidate.is_some());
        assert!(result.verdict.is_none());
        assert!(!result.is_accepted());
    }

    #[tokio::test]
    async fn baseline_failures_become_fail_verdicts() {
        let generator = ScriptedGenerator::new(|_| Step::Hang);
        let verifier = ScriptedVerifier::always_fail();
        let result = arbiter(&generator, &verifier, config(5, 2))
            .run_baseline(task(), false)
            .await;
        assert!(result.candidate.is_none());
        assert!(result.verdict.unwrap().has_issue(IssueKind::GenerationFailure));
        assert_eq!(verifier.calls(), 0);

        let generator = ScriptedGenerator::new(|_| Step::Source(LOOP.into()));
        let verifier = ScriptedVerifier::new(|_| None);
        let result = arbiter(&generator, &verifier, config(5, 2))
            .run_baseline(task(), true)
            .await;
        assert!(result.verdict.unwrap().has_issue(IssueKind::VerifierUnavailable));
    }
}
