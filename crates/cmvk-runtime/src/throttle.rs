//! Request-rate limiting for model collaborators.
//!
//! [`Throttled`] wraps a [`Generator`] or [`Verifier`] and waits on a shared
//! `governor` limiter before every call.  Clone the [`SharedLimiter`] into
//! several wrappers when two collaborators draw on the same API quota.

use std::collections::BTreeSet;
use std::num::NonZeroU32;
use std::sync::Arc;

use async_trait::async_trait;
use cmvk_types::{Candidate, CmvkError, Proposal, StrategyTag, Task, Verdict};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

use crate::collaborators::{Generator, Verifier};

pub type SharedLimiter = Arc<DefaultDirectRateLimiter>;

/// A limiter admitting `per_minute` calls per minute.  Zero is rejected.
pub fn per_minute(per_minute: u32) -> Result<SharedLimiter, CmvkError> {
    let n = NonZeroU32::new(per_minute)
        .ok_or_else(|| CmvkError::InvalidConfig("requests per minute must be at least 1".into()))?;
    Ok(Arc::new(RateLimiter::direct(Quota::per_minute(n))))
}

pub struct Throttled<T> {
    inner: T,
    limiter: SharedLimiter,
}

impl<T> Throttled<T> {
    pub fn new(inner: T, limiter: SharedLimiter) -> Self {
        Self { inner, limiter }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[async_trait]
impl<T: Generator> Generator for Throttled<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn generate(
        &self,
        task: &Task,
        forbidden: &BTreeSet<StrategyTag>,
        feedback: Option<&Verdict>,
    ) -> Result<Proposal, CmvkError> {
        self.limiter.until_ready().await;
        self.inner.generate(task, forbidden, feedback).await
    }
}

#[async_trait]
impl<T: Verifier> Verifier for Throttled<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn verify(&self, candidate: &Candidate, task: &Task) -> Result<Verdict, CmvkError> {
        self.limiter.until_ready().await;
        self.inner.verify(candidate, task).await
    }
}
