//! Candidate fingerprinting.
//!
//! A [`Fingerprint`] is the lowercase hex SHA-256 digest of a candidate's
//! source text.  Two modes are supported:
//!
//! - [`FingerprintMode::Exact`] (default) hashes the bytes as given, so only
//!   byte-identical resubmissions collide.
//! - [`FingerprintMode::Normalized`] strips `#` / `//` line comments and
//!   collapses runs of whitespace first, so cosmetic edits map to the same
//!   fingerprint.
//!
//! When a Graph of Truth is shared across tasks, build the fingerprinter with
//! [`Fingerprinter::scoped_to`] so the task id is mixed into every digest.
//!
//! # Example
//!
//! ```
//! use cmvk_kernel::fingerprint::{Fingerprinter, FingerprintMode};
//!
//! let exact = Fingerprinter::new(FingerprintMode::Exact);
//! assert_ne!(exact.fingerprint("x = 1"), exact.fingerprint("x  =  1"));
//!
//! let loose = Fingerprinter::new(FingerprintMode::Normalized);
//! assert_eq!(loose.fingerprint("x = 1"), loose.fingerprint("x  =  1  # one"));
//! ```

use cmvk_types::Fingerprint;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintMode {
    #[default]
    Exact,
    Normalized,
}

/// Computes stable fingerprints for candidate source text.
#[derive(Debug, Clone, Default)]
pub struct Fingerprinter {
    mode: FingerprintMode,
    scope: Option<String>,
}

impl Fingerprinter {
    pub fn new(mode: FingerprintMode) -> Self {
        Self { mode, scope: None }
    }

    /// Mix `task_id` into every fingerprint so verdicts cached for one task
    /// are never served to another.
    pub fn scoped_to(mut self, task_id: impl Into<String>) -> Self {
        self.scope = Some(task_id.into());
        self
    }

    pub fn mode(&self) -> FingerprintMode {
        self.mode
    }

    pub fn fingerprint(&self, source: &str) -> Fingerprint {
        let mut hasher = Sha256::new();
        if let Some(scope) = &self.scope {
            hasher.update(scope.as_bytes());
            // Separator so ("ab", "c") and ("a", "bc") cannot collide.
            hasher.update([0u8]);
        }
        match self.mode {
            FingerprintMode::Exact => hasher.update(source.as_bytes()),
            FingerprintMode::Normalized => hasher.update(normalize(source).as_bytes()),
        }
        Fingerprint::from_hex(hex::encode(hasher.finalize()))
    }
}

/// Strip line comments and collapse whitespace.
///
/// Comment markers inside string literals are not recognised; this is a
/// textual normalisation, not a parser.
pub fn normalize(source: &str) -> String {
    source
        .lines()
        .map(strip_line_comment)
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn strip_line_comment(line: &str) -> &str {
    let cut = [line.find('#'), line.find("//")]
        .into_iter()
        .flatten()
        .min();
    match cut {
        Some(i) => &line[..i],
        None => line,
    }
}
