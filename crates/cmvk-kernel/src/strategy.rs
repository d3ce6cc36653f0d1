//! Strategy classification.
//!
//! The kernel needs to know *which approach* a candidate takes so it can ban
//! approaches that keep failing.  Classification is a best-effort textual
//! heuristic, not a proof of algorithmic equivalence.
//!
//! [`StrategyClassifier`] is the contract the kernel depends on.  The shipped
//! implementation, [`RuleClassifier`], evaluates [`StrategyRule`]s in
//! insertion order and returns the first match, falling back to
//! [`StrategyTag::UNCLASSIFIED`].
//!
//! # Example
//!
//! ```
//! use cmvk_kernel::strategy::{RuleClassifier, StrategyClassifier};
//!
//! let classifier = RuleClassifier::default();
//! assert_eq!(classifier.classify("return sorted(a + b)").as_str(), "built-in-sort");
//! assert_eq!(classifier.classify("pass").as_str(), "unclassified");
//! ```

use cmvk_types::StrategyTag;

// ─────────────────────────────────────────────────────────────────────────────
// Contracts
// ─────────────────────────────────────────────────────────────────────────────

/// Maps candidate source text to a strategy tag.
///
/// Implementations must be deterministic and total: the same source always
/// yields the same tag, and classification never fails.
pub trait StrategyClassifier: Send + Sync {
    fn classify(&self, source: &str) -> StrategyTag;
}

/// A single recognisable pattern.  The rule's [`name`](StrategyRule::name) is
/// the tag it assigns.
pub trait StrategyRule: Send + Sync {
    fn name(&self) -> &str;

    fn matches(&self, source: &str) -> bool;
}

// ─────────────────────────────────────────────────────────────────────────────
// RuleClassifier
// ─────────────────────────────────────────────────────────────────────────────

/// Ordered list of [`StrategyRule`]s.  The first matching rule wins.
pub struct RuleClassifier {
    rules: Vec<Box<dyn StrategyRule>>,
}

impl RuleClassifier {
    /// A classifier with no rules: everything is `unclassified`.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Register a rule.  Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn StrategyRule>) {
        self.rules.push(rule);
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }
}

impl Default for RuleClassifier {
    /// The built-in vocabulary, most specific first.
    fn default() -> Self {
        let mut c = Self::empty();
        c.add_rule(Box::new(PatternRule::new(
            "built-in-sort",
            &["sorted(", ".sort(", ".sort_by", ".sort_unstable", "Arrays.sort", "std::sort"],
        )));
        c.add_rule(Box::new(
            PatternRule::new(
                "regex",
                &["import re as ", "from re import", "re.compile", "re.match", "re.fullmatch", "Regex::new", "new RegExp"],
            )
            .with_line("import re"),
        ));
        c.add_rule(Box::new(PatternRule::new(
            "heap",
            &["heapq", "BinaryHeap", "PriorityQueue"],
        )));
        c.add_rule(Box::new(RecursionRule));
        c.add_rule(Box::new(PatternRule::new(
            "iterative",
            &["for ", "while ", "loop {"],
        )));
        c
    }
}

impl StrategyClassifier for RuleClassifier {
    fn classify(&self, source: &str) -> StrategyTag {
        self.rules
            .iter()
            .find(|r| r.matches(source))
            .map(|r| StrategyTag::new(r.name()))
            .unwrap_or_else(StrategyTag::unclassified)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ─────────────────────────────────────────────────────────────────────────────

/// Matches when the source contains any of a set of substrings, or any line
/// equal (ignoring surrounding whitespace) to one of a set of whole lines.
pub struct PatternRule {
    tag: String,
    needles: Vec<String>,
    lines: Vec<String>,
}

impl PatternRule {
    pub fn new(tag: impl Into<String>, needles: &[&str]) -> Self {
        Self {
            tag: tag.into(),
            needles: needles.iter().map(|n| n.to_string()).collect(),
            lines: Vec::new(),
        }
    }

    /// Also match a line consisting of exactly `line`.
    pub fn with_line(mut self, line: impl Into<String>) -> Self {
        self.lines.push(line.into());
        self
    }
}

impl StrategyRule for PatternRule {
    fn name(&self) -> &str {
        &self.tag
    }

    fn matches(&self, source: &str) -> bool {
        self.needles.iter().any(|n| source.contains(n.as_str()))
            || source
                .lines()
                .any(|l| self.lines.iter().any(|w| l.trim() == w.as_str()))
    }
}

/// Matches when a function defined in the source calls itself.
///
/// Recognises `def name(`, `fn name(` and `function name(` definitions and
/// looks for a second `name(` occurrence that starts at an identifier
/// boundary, so `add(` is not a call to `d`.
pub struct RecursionRule;

const DEF_KEYWORDS: [&str; 3] = ["def ", "fn ", "function "];

impl RecursionRule {
    fn defined_functions(source: &str) -> Vec<&str> {
        let mut names = Vec::new();
        for line in source.lines() {
            let trimmed = line.trim_start();
            let trimmed = trimmed.strip_prefix("pub ").unwrap_or(trimmed);
            let trimmed = trimmed.strip_prefix("async ").unwrap_or(trimmed);
            for kw in DEF_KEYWORDS {
                if let Some(rest) = trimmed.strip_prefix(kw) {
                    let name: &str = rest
                        .split(|c: char| !is_ident_char(c))
                        .next()
                        .unwrap_or("");
                    if !name.is_empty() {
                        names.push(name);
                    }
                }
            }
        }
        names
    }
}

impl StrategyRule for RecursionRule {
    fn name(&self) -> &str {
        "recursive"
    }

    fn matches(&self, source: &str) -> bool {
        Self::defined_functions(source).into_iter().any(|name| {
            let call = format!("{name}(");
            source
                .match_indices(call.as_str())
                .filter(|(at, _)| !source[..*at].ends_with(is_ident_char))
                .count()
                > 1
        })
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}
