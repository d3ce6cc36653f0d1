//! [`GraphOfTruth`] – content-addressed verdict memory.
//!
//! Maps a candidate [`Fingerprint`] to the [`Verdict`] the Verifier returned
//! for it.  The kernel consults the graph before every Verifier call so that
//! resubmitting identical source is answered from memory.
//!
//! A recorded verdict is never replaced.  Recording the *same* verdict twice
//! is a no-op; recording a *different* verdict for a known fingerprint means
//! the Verifier is non-deterministic, and [`GraphOfTruth::record`] returns
//! [`CmvkError::DuplicateFingerprintConflict`] instead of picking one.
//!
//! # Example
//!
//! ```
//! use cmvk_kernel::graph_of_truth::GraphOfTruth;
//! use cmvk_types::{Fingerprint, Verdict};
//!
//! let mut graph = GraphOfTruth::new();
//! let fp = Fingerprint::from_hex("abc123");
//!
//! assert!(graph.lookup(&fp).is_none());
//! graph.record(fp.clone(), Verdict::pass(0.9)).unwrap();
//! assert!(graph.lookup(&fp).unwrap().is_pass());
//!
//! // A different outcome for the same fingerprint is rejected.
//! assert!(graph.record(fp, Verdict::fail(vec![], 0.9)).is_err());
//! ```

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use cmvk_types::{CmvkError, Fingerprint, Verdict};
use tracing::{debug, warn};

/// Summary counters, handy for end-of-run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GraphStats {
    pub entries: usize,
    pub passed: usize,
    pub failed: usize,
}

/// Fingerprint → verdict cache.
#[derive(Debug, Default)]
pub struct GraphOfTruth {
    verdicts: HashMap<Fingerprint, Verdict>,
}

impl GraphOfTruth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the verdict previously recorded for `fingerprint`, if any.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<&Verdict> {
        self.verdicts.get(fingerprint)
    }

    /// Store `verdict` under `fingerprint`.
    ///
    /// # Errors
    ///
    /// [`CmvkError::DuplicateFingerprintConflict`] when a different verdict is
    /// already stored for the fingerprint.  The stored verdict is left intact.
    pub fn record(&mut self, fingerprint: Fingerprint, verdict: Verdict) -> Result<(), CmvkError> {
        match self.verdicts.entry(fingerprint) {
            Entry::Vacant(slot) => {
                debug!(fingerprint = %slot.key().short(), status = ?verdict.status, "recorded verdict");
                slot.insert(verdict);
                Ok(())
            }
            Entry::Occupied(slot) if *slot.get() == verdict => Ok(()),
            Entry::Occupied(slot) => {
                warn!(
                    fingerprint = %slot.key().short(),
                    stored = ?slot.get().status,
                    offered = ?verdict.status,
                    "non-deterministic verifier: conflicting verdicts for identical source"
                );
                Err(CmvkError::DuplicateFingerprintConflict {
                    fingerprint: slot.key().clone(),
                })
            }
        }
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.verdicts.contains_key(fingerprint)
    }

    /// `true` when `fingerprint` is known and its verdict was a FAIL.
    pub fn is_known_failure(&self, fingerprint: &Fingerprint) -> bool {
        self.lookup(fingerprint).is_some_and(|v| !v.is_pass())
    }

    pub fn len(&self) -> usize {
        self.verdicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verdicts.is_empty()
    }

    pub fn stats(&self) -> GraphStats {
        let passed = self.verdicts.values().filter(|v| v.is_pass()).count();
        GraphStats {
            entries: self.verdicts.len(),
            passed,
            failed: self.verdicts.len() - passed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmvk_types::{Issue, Severity};

    fn fp(s: &str) -> Fingerprint {
        Fingerprint::from_hex(s)
    }

    fn failing() -> Verdict {
        Verdict::fail(vec![Issue::defect(Severity::High, "off by one")], 0.8)
    }

    #[test]
    fn empty_graph_has_no_entries() {
        let graph = GraphOfTruth::new();
        assert!(graph.is_empty());
        assert!(graph.lookup(&fp("a")).is_none());
    }

    #[test]
    fn record_then_lookup() {
        let mut graph = GraphOfTruth::new();
        graph.record(fp("a"), failing()).unwrap();
        assert_eq!(graph.lookup(&fp("a")), Some(&failing()));
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn identical_rerecord_is_idempotent() {
        let mut graph = GraphOfTruth::new();
        graph.record(fp("a"), failing()).unwrap();
        assert!(graph.record(fp("a"), failing()).is_ok());
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn conflicting_rerecord_is_rejected_and_original_kept() {
        let mut graph = GraphOfTruth::new();
        graph.record(fp("a"), failing()).unwrap();
        let err = graph.record(fp("a"), Verdict::pass(0.9)).unwrap_err();
        assert!(matches!(
            err,
            CmvkError::DuplicateFingerprintConflict { ref fingerprint } if fingerprint.as_str() == "a"
        ));
        assert_eq!(graph.lookup(&fp("a")), Some(&failing()));
    }

    #[test]
    fn differing_issue_lists_also_conflict() {
        let mut graph = GraphOfTruth::new();
        graph.record(fp("a"), failing()).unwrap();
        let other = Verdict::fail(vec![Issue::defect(Severity::Low, "style")], 0.8);
        assert!(graph.record(fp("a"), other).is_err());
    }

    #[test]
    fn known_failure_detection() {
        let mut graph = GraphOfTruth::new();
        graph.record(fp("bad"), failing()).unwrap();
        graph.record(fp("good"), Verdict::pass(1.0)).unwrap();
        assert!(graph.is_known_failure(&fp("bad")));
        assert!(!graph.is_known_failure(&fp("good")));
        assert!(!graph.is_known_failure(&fp("unknown")));
    }

    #[test]
    fn stats_count_by_status() {
        let mut graph = GraphOfTruth::new();
        graph.record(fp("a"), failing()).unwrap();
        graph.record(fp("b"), failing()).unwrap();
        graph.record(fp("c"), Verdict::pass(1.0)).unwrap();
        assert_eq!(
            graph.stats(),
            GraphStats {
                entries: 3,
                passed: 1,
                failed: 2
            }
        );
    }
}
