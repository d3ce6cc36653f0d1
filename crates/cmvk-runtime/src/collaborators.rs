//! Generator and Verifier contracts.
//!
//! The arbiter treats both models as opaque capability providers.  It only
//! sees these two traits, so a local model, a hosted API, a sandbox-backed
//! oracle or a test double can be swapped in without touching the loop.
//!
//! [`NullGenerator`] and [`NullVerifier`] are the stand-ins used when no model
//! endpoint is configured.  They keep the whole pipeline runnable (and say so
//! loudly in the logs) instead of the arbiter branching on "is there a model".

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use cmvk_types::{Candidate, CmvkError, Proposal, StrategyTag, Task, Verdict};
use tracing::warn;

// ─────────────────────────────────────────────────────────────────────────────
// Contracts
// ─────────────────────────────────────────────────────────────────────────────

/// Proposes candidate solutions.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &str {
        "generator"
    }

    /// Propose a solution for `task` that avoids every strategy in
    /// `forbidden`.  `feedback` is the verdict of the previous attempt.
    ///
    /// # Errors
    ///
    /// [`CmvkError::GenerationFailure`] when no usable proposal could be
    /// produced.
    async fn generate(
        &self,
        task: &Task,
        forbidden: &BTreeSet<StrategyTag>,
        feedback: Option<&Verdict>,
    ) -> Result<Proposal, CmvkError>;
}

/// Adversarially judges candidates.
#[async_trait]
pub trait Verifier: Send + Sync {
    fn name(&self) -> &str {
        "verifier"
    }

    /// Judge `candidate` against `task`.  A FAIL verdict is a successful call.
    ///
    /// # Errors
    ///
    /// [`CmvkError::VerificationFailure`] when the verifier could not produce
    /// a verdict at all.
    async fn verify(&self, candidate: &Candidate, task: &Task) -> Result<Verdict, CmvkError>;
}

#[async_trait]
impl<T: Generator + ?Sized> Generator for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn generate(
        &self,
        task: &Task,
        forbidden: &BTreeSet<StrategyTag>,
        feedback: Option<&Verdict>,
    ) -> Result<Proposal, CmvkError> {
        (**self).generate(task, forbidden, feedback).await
    }
}

#[async_trait]
impl<T: Verifier + ?Sized> Verifier for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn verify(&self, candidate: &Candidate, task: &Task) -> Result<Verdict, CmvkError> {
        (**self).verify(candidate, task).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Null objects
// ─────────────────────────────────────────────────────────────────────────────

/// Confidence reported by [`NullVerifier`].
pub const NULL_VERIFIER_CONFIDENCE: f32 = 0.75;

/// Generator used when no model is configured.
///
/// Proposes a placeholder that restates the task as a comment.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullGenerator;

#[async_trait]
impl Generator for NullGenerator {
    fn name(&self) -> &str {
        "null-generator"
    }

    async fn generate(
        &self,
        task: &Task,
        _forbidden: &BTreeSet<StrategyTag>,
        _feedback: Option<&Verdict>,
    ) -> Result<Proposal, CmvkError> {
        warn!(task = %task.id, "no generator configured; proposing placeholder");
        let mut proposal = Proposal::new(format!(
            "# placeholder solution for task {}\n# {}\n",
            task.id,
            task.statement.lines().next().unwrap_or_default()
        ));
        proposal.explanation = Some("placeholder: no generator configured".into());
        Ok(proposal)
    }
}

/// Verifier used when no model is configured.  Always passes with
/// [`NULL_VERIFIER_CONFIDENCE`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NullVerifier;

#[async_trait]
impl Verifier for NullVerifier {
    fn name(&self) -> &str {
        "null-verifier"
    }

    async fn verify(&self, candidate: &Candidate, _task: &Task) -> Result<Verdict, CmvkError> {
        warn!(
            fingerprint = %candidate.fingerprint.short(),
            "no verifier configured; passing candidate unchecked"
        );
        Ok(Verdict::pass(NULL_VERIFIER_CONFIDENCE))
    }
}
