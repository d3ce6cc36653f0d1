//! [`BanPolicy`] – forces the Generator to diversify.
//!
//! Counts organic failures per [`StrategyTag`] and moves a tag into the
//! forbidden set the moment its counter reaches the ban threshold.  The
//! policy is monotonic: nothing ever leaves the forbidden set within an
//! episode.
//!
//! Only *organic* failures belong here – a fresh candidate the Verifier
//! actually rejected.  Cache hits, Generator failures, Verifier outages and
//! forbidden-strategy violations must not be fed to
//! [`BanPolicy::record_failure`].
//!
//! # Example
//!
//! ```rust
//! use cmvk_kernel::ban_policy::BanPolicy;
//! use cmvk_types::StrategyTag;
//!
//! let mut policy = BanPolicy::new(2);
//! let sort = StrategyTag::new("built-in-sort");
//!
//! assert!(!policy.record_failure(&sort));
//! assert!(policy.record_failure(&sort)); // second failure → banned
//! assert!(policy.is_forbidden(&sort));
//! ```

use std::collections::{BTreeSet, HashMap};

use cmvk_types::StrategyTag;
use tracing::info;

/// Strategy failure counters plus the forbidden set derived from them.
#[derive(Debug, Clone)]
pub struct BanPolicy {
    /// Number of organic failures that bans a strategy.
    threshold: u32,
    counters: HashMap<StrategyTag, u32>,
    forbidden: BTreeSet<StrategyTag>,
}

impl BanPolicy {
    /// Create a policy banning a strategy after `threshold` organic failures.
    ///
    /// A `threshold` of 1 bans on first failure.  Callers validate that the
    /// threshold is at least 1; a zero is treated as 1.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            counters: HashMap::new(),
            forbidden: BTreeSet::new(),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Record one organic failure for `tag`.
    ///
    /// Returns `true` exactly when this failure moved `tag` into the
    /// forbidden set.
    pub fn record_failure(&mut self, tag: &StrategyTag) -> bool {
        let count = self.counters.entry(tag.clone()).or_insert(0);
        *count += 1;
        if *count >= self.threshold && !self.forbidden.contains(tag) {
            info!(strategy = %tag, failures = *count, "strategy banned");
            self.forbidden.insert(tag.clone());
            return true;
        }
        false
    }

    pub fn is_forbidden(&self, tag: &StrategyTag) -> bool {
        self.forbidden.contains(tag)
    }

    /// Organic failures recorded so far for `tag`.
    pub fn failures(&self, tag: &StrategyTag) -> u32 {
        self.counters.get(tag).copied().unwrap_or(0)
    }

    pub fn forbidden(&self) -> &BTreeSet<StrategyTag> {
        &self.forbidden
    }

    pub fn counters(&self) -> &HashMap<StrategyTag, u32> {
        &self.counters
    }
}

/// Recompute a forbidden set from scratch: `tag` is forbidden iff
/// `counters[tag] >= threshold`.
///
/// [`BanPolicy`] maintains the same set incrementally; this function is the
/// reference it must agree with.
pub fn forbidden_set(counters: &HashMap<StrategyTag, u32>, threshold: u32) -> BTreeSet<StrategyTag> {
    let threshold = threshold.max(1);
    counters
        .iter()
        .filter(|(_, n)| **n >= threshold)
        .map(|(tag, _)| tag.clone())
        .collect()
}
