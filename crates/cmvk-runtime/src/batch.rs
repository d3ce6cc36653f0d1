//! [`BatchRunner`] – many episodes, bounded concurrency.
//!
//! Episodes share no mutable state, so a batch is a plain fan-out: every task
//! gets its own episode on a `JoinSet`, and a `Semaphore` caps how many run
//! at once (keep it at or below what the model API tolerates).  Reports come
//! back in input order regardless of completion order, one per task.
//!
//! [`BatchRunner::run_baseline`] fans the same tasks out through the control
//! arm (one generation each, no loop) so both acceptance rates can be set
//! side by side.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use cmvk_types::{BaselineResult, CmvkError, EpisodeOutcome, EpisodeResult, Task};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};
use tracing::{debug, info, warn};

use crate::arbiter::Arbiter;

/// Outcome of one task in a batch.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task_id: String,
    pub result: Result<EpisodeResult, CmvkError>,
}

/// Aggregate counters over a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub accepted: usize,
    pub exhausted: usize,
    /// Episodes that aborted with an error.
    pub errored: usize,
    pub attempts: usize,
    pub cache_hits: usize,
}

impl BatchSummary {
    pub fn from_reports(reports: &[TaskReport]) -> Self {
        let mut summary = Self {
            total: reports.len(),
            ..Self::default()
        };
        for report in reports {
            match &report.result {
                Ok(result) => {
                    match result.outcome {
                        EpisodeOutcome::Accepted => summary.accepted += 1,
                        EpisodeOutcome::Exhausted => summary.exhausted += 1,
                    }
                    summary.attempts += result.attempts.len();
                    summary.cache_hits += result.cache_hits();
                }
                Err(_) => summary.errored += 1,
            }
        }
        summary
    }

    /// Share of tasks accepted, in `[0, 1]`.  Zero for an empty batch.
    pub fn acceptance_rate(&self) -> f64 {
        rate(self.accepted, self.total)
    }
}

/// Control-arm outcome of one task.
#[derive(Debug, Clone)]
pub struct BaselineReport {
    pub task_id: String,
    pub result: Result<BaselineResult, CmvkError>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BaselineSummary {
    pub total: usize,
    /// Tasks that ended with a verdict.
    pub judged: usize,
    pub accepted: usize,
    pub generation_failures: usize,
    pub errored: usize,
}

impl BaselineSummary {
    pub fn from_reports(reports: &[BaselineReport]) -> Self {
        let mut summary = Self {
            total: reports.len(),
            ..Self::default()
        };
        for report in reports {
            match &report.result {
                Ok(result) => {
                    summary.judged += usize::from(result.is_judged());
                    summary.accepted += usize::from(result.is_accepted());
                    summary.generation_failures += usize::from(result.candidate.is_none());
                }
                Err(_) => summary.errored += 1,
            }
        }
        summary
    }

    /// Share of all tasks accepted; unjudged tasks count as not accepted.
    pub fn acceptance_rate(&self) -> f64 {
        rate(self.accepted, self.total)
    }
}

fn rate(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

pub struct BatchRunner {
    arbiter: Arc<Arbiter>,
    concurrency: usize,
}

impl BatchRunner {
    /// `concurrency` is clamped to at least 1.
    pub fn new(arbiter: Arc<Arbiter>, concurrency: usize) -> Self {
        Self {
            arbiter,
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run every task to completion.
    ///
    /// A panicking episode is propagated to the caller.  A cancelled one is
    /// reported as [`CmvkError::EpisodeAborted`].
    pub async fn run(&self, tasks: Vec<Task>) -> Vec<TaskReport> {
        info!(tasks = tasks.len(), concurrency = self.concurrency, "batch started");
        let reports: Vec<TaskReport> = self
            .fan_out(tasks, |arbiter, task| async move { arbiter.run_episode(task).await })
            .await
            .into_iter()
            .map(|(task_id, result)| TaskReport { task_id, result })
            .collect();
        let summary = BatchSummary::from_reports(&reports);
        info!(
            accepted = summary.accepted,
            exhausted = summary.exhausted,
            errored = summary.errored,
            "batch finished"
        );
        reports
    }

    /// Run every task through [`Arbiter::run_baseline`].
    pub async fn run_baseline(&self, tasks: Vec<Task>, judge: bool) -> Vec<BaselineReport> {
        info!(tasks = tasks.len(), concurrency = self.concurrency, judge, "baseline started");
        let reports: Vec<BaselineReport> = self
            .fan_out(tasks, move |arbiter, task| async move {
                Ok::<_, CmvkError>(arbiter.run_baseline(task, judge).await)
            })
            .await
            .into_iter()
            .map(|(task_id, result)| BaselineReport { task_id, result })
            .collect();
        let summary = BaselineSummary::from_reports(&reports);
        info!(
            accepted = summary.accepted,
            judged = summary.judged,
            errored = summary.errored,
            "baseline finished"
        );
        reports
    }

    /// Spawn `work` per task under the semaphore and collect the results in
    /// input order, paired with the task id.
    async fn fan_out<R, F, Fut>(&self, tasks: Vec<Task>, work: F) -> Vec<(String, Result<R, CmvkError>)>
    where
        R: Send + 'static,
        F: Fn(Arc<Arbiter>, Task) -> Fut,
        Fut: Future<Output = Result<R, CmvkError>> + Send + 'static,
    {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();
        let mut task_ids = Vec::with_capacity(tasks.len());
        let mut index_of: HashMap<Id, usize> = HashMap::with_capacity(tasks.len());

        for (index, task) in tasks.into_iter().enumerate() {
            task_ids.push(task.id.clone());
            let permits = Arc::clone(&permits);
            let task_id = task.id.clone();
            let run = work(Arc::clone(&self.arbiter), task);
            let handle = set.spawn(async move {
                // the semaphore is never closed
                let _permit = permits.acquire_owned().await.ok();
                debug!(task = %task_id, "episode scheduled");
                (index, run.await)
            });
            index_of.insert(handle.id(), index);
        }

        let mut slots: Vec<Option<Result<R, CmvkError>>> = task_ids.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            settle(&mut slots, &index_of, joined);
        }
        task_ids
            .into_iter()
            .zip(slots)
            .map(|(task_id, slot)| {
                let result = slot.unwrap_or_else(|| {
                    Err(CmvkError::EpisodeAborted("episode task produced no result".into()))
                });
                (task_id, result)
            })
            .collect()
    }
}

/// File one joined task into its slot.  Panics are re-raised.
fn settle<R>(
    slots: &mut [Option<Result<R, CmvkError>>],
    index_of: &HashMap<Id, usize>,
    joined: Result<(usize, Result<R, CmvkError>), JoinError>,
) {
    match joined {
        Ok((index, result)) => slots[index] = Some(result),
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => {
            warn!(error = %e, "episode task cancelled");
            if let Some(&index) = index_of.get(&e.id()) {
                slots[index] = Some(Err(CmvkError::EpisodeAborted(e.to_string())));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::ArbiterConfig;
    use crate::collaborators::{Generator, NullGenerator, NullVerifier, Verifier};
    use async_trait::async_trait;
    use cmvk_types::{Candidate, Proposal, StrategyTag, Verdict};
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Generator that tracks how many calls overlap.
    #[derive(Default)]
    struct SlowGenerator {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Generator for SlowGenerator {
        async fn generate(
            &self,
            task: &Task,
            _forbidden: &BTreeSet<StrategyTag>,
            _feedback: Option<&Verdict>,
        ) -> Result<Proposal, CmvkError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Proposal::new(format!("answer = '{}'", task.id)))
        }
    }

    /// Passes tasks whose id starts with "ok".
    struct PrefixVerifier;

    #[async_trait]
    impl Verifier for PrefixVerifier {
        async fn verify(&self, candidate: &Candidate, task: &Task) -> Result<Verdict, CmvkError> {
            let _ = candidate;
            Ok(if task.id.starts_with("ok") {
                Verdict::pass(1.0)
            } else {
                Verdict::fail(vec![], 1.0)
            })
        }
    }

    fn tasks(ids: &[&str]) -> Vec<Task> {
        ids.iter().map(|id| Task::new(*id, "s")).collect()
    }

    #[tokio::test]
    async fn reports_keep_input_order() {
        let arbiter = Arbiter::new(NullGenerator, NullVerifier, ArbiterConfig::default()).unwrap();
        let runner = BatchRunner::new(Arc::new(arbiter), 3);
        let ids = ["a", "b", "c", "d", "e"];
        let reports = runner.run(tasks(&ids)).await;
        let got: Vec<&str> = reports.iter().map(|r| r.task_id.as_str()).collect();
        assert_eq!(got, ids);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let generator = Arc::new(SlowGenerator::default());
        let arbiter = Arbiter::new(generator.clone(), NullVerifier, ArbiterConfig::default()).unwrap();
        let runner = BatchRunner::new(Arc::new(arbiter), 2);
        runner.run(tasks(&["1", "2", "3", "4", "5", "6"])).await;
        let peak = generator.peak.load(Ordering::SeqCst);
        assert!(peak <= 2, "peak concurrency {peak}");
        assert!(peak >= 1);
    }

    #[tokio::test]
    async fn summary_counts_outcomes() {
        let config = ArbiterConfig {
            max_loops: 2,
            ..ArbiterConfig::default()
        };
        let arbiter = Arbiter::new(SlowGenerator::default(), PrefixVerifier, config).unwrap();
        let runner = BatchRunner::new(Arc::new(arbiter), 4);
        let reports = runner.run(tasks(&["ok-1", "bad-1", "ok-2"])).await;
        let summary = BatchSummary::from_reports(&reports);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.accepted, 2);
        assert_eq!(summary.exhausted, 1);
        assert_eq!(summary.errored, 0);
        // bad-1: one verified failure, then the identical source is a cache hit
        assert_eq!(summary.attempts, 4);
        assert_eq!(summary.cache_hits, 1);
        assert!((summary.acceptance_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    /// Wrong until it has seen a verdict, right afterwards.
    struct SecondTryGenerator;

    #[async_trait]
    impl Generator for SecondTryGenerator {
        async fn generate(
            &self,
            _task: &Task,
            _forbidden: &BTreeSet<StrategyTag>,
            feedback: Option<&Verdict>,
        ) -> Result<Proposal, CmvkError> {
            Ok(Proposal::new(match feedback {
                None => "answer = 'wrong'",
                Some(_) => "answer = 'right'",
            }))
        }
    }

    struct RightAnswerVerifier;

    #[async_trait]
    impl Verifier for RightAnswerVerifier {
        async fn verify(&self, candidate: &Candidate, _task: &Task) -> Result<Verdict, CmvkError> {
            Ok(if candidate.source.contains("'right'") {
                Verdict::pass(1.0)
            } else {
                Verdict::fail(vec![], 1.0)
            })
        }
    }

    #[tokio::test]
    async fn baseline_and_loop_over_the_same_tasks() {
        let arbiter = Arbiter::new(SecondTryGenerator, RightAnswerVerifier, ArbiterConfig::default()).unwrap();
        let runner = BatchRunner::new(Arc::new(arbiter), 2);
        let ids = ["a", "b", "c"];

        let baseline = runner.run_baseline(tasks(&ids), true).await;
        let got: Vec<&str> = baseline.iter().map(|r| r.task_id.as_str()).collect();
        assert_eq!(got, ids);
        let control = BaselineSummary::from_reports(&baseline);
        assert_eq!(control.total, 3);
        assert_eq!(control.judged, 3);
        assert_eq!(control.accepted, 0);
        assert_eq!(control.acceptance_rate(), 0.0);

        let treated = BatchSummary::from_reports(&runner.run(tasks(&ids)).await);
        assert_eq!(treated.accepted, 3);
        assert_eq!(treated.attempts, 6);
        assert_eq!(treated.acceptance_rate(), 1.0);
    }

    #[tokio::test]
    async fn unjudged_baseline_accepts_nothing() {
        let arbiter = Arbiter::new(NullGenerator, NullVerifier, ArbiterConfig::default()).unwrap();
        let runner = BatchRunner::new(Arc::new(arbiter), 2);
        let summary = BaselineSummary::from_reports(&runner.run_baseline(tasks(&["a", "b"]), false).await);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.judged, 0);
        assert_eq!(summary.accepted, 0);
        assert_eq!(summary.generation_failures, 0);
    }

    #[tokio::test]
    async fn cancelled_task_keeps_its_slot() {
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            (1usize, Ok::<u32, CmvkError>(0))
        });
        let index_of = HashMap::from([(handle.id(), 1)]);
        handle.abort();
        let joined = handle.await;
        assert!(joined.as_ref().is_err_and(|e| e.is_cancelled()));

        let mut slots: Vec<Option<Result<u32, CmvkError>>> = vec![None, None];
        settle(&mut slots, &index_of, Ok((0, Ok(7))));
        settle(&mut slots, &index_of, joined);
        assert_eq!(slots[0], Some(Ok(7)));
        assert!(matches!(slots[1], Some(Err(CmvkError::EpisodeAborted(_)))));

        // still counted, as an error
        let reports = vec![TaskReport {
            task_id: "t".into(),
            result: Err(CmvkError::EpisodeAborted("cancelled".into())),
        }];
        assert_eq!(BatchSummary::from_reports(&reports).errored, 1);
    }

    #[test]
    fn zero_concurrency_is_clamped() {
        let arbiter = Arbiter::new(NullGenerator, NullVerifier, ArbiterConfig::default()).unwrap();
        assert_eq!(BatchRunner::new(Arc::new(arbiter), 0).concurrency(), 1);
    }

    #[test]
    fn empty_summary() {
        let summary = BatchSummary::from_reports(&[]);
        assert_eq!(summary.total, 0);
        assert_eq!(summary.acceptance_rate(), 0.0);
    }
}
