//! Sandboxed execution of candidate code.
//!
//! The arbiter never runs code itself.  A [`SandboxVerifier`] is a
//! [`Verifier`] that resolves the task's oracle to a [`TestSuite`], hands the
//! candidate and the suite to a [`SandboxExecutor`], and turns the
//! [`ExecutionReport`] into a verdict:
//!
//! - PASS iff the process exited with code 0 and no test failed.
//! - Every failed test becomes a `High` defect.
//! - A non-zero exit with no failed test becomes a `Critical` defect carrying
//!   the tail of the output.
//!
//! # Harness protocol
//!
//! [`ProcessExecutor`] pipes `source + "\n" + harness` into an interpreter's
//! stdin and reads one result per line from stdout:
//!
//! ```text
//! PASS <test name>
//! FAIL <test name>
//! ```
//!
//! Any other output is kept in [`ExecutionReport::stdout`] untouched.  Tests
//! declared in [`TestSuite::tests`] that never report are counted as failed.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use cmvk_types::{Candidate, CmvkError, Issue, Severity, Task, Verdict};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::collaborators::Verifier;

/// Characters of output kept in a crash issue.
const OUTPUT_TAIL: usize = 400;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("failed to spawn sandbox process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("execution exceeded time limit of {0:?}")]
    Timeout(Duration),
}

impl From<SandboxError> for CmvkError {
    fn from(e: SandboxError) -> Self {
        CmvkError::VerificationFailure(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Data
// ─────────────────────────────────────────────────────────────────────────────

/// Test oracle for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSuite {
    pub id: String,
    /// Code appended after the candidate source; reports results using the
    /// harness protocol.
    pub harness: String,
    /// Names of the tests the harness is expected to report.
    #[serde(default)]
    pub tests: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub stdout: String,
    pub exit_code: i32,
    pub passed_tests: Vec<String>,
    pub failed_tests: Vec<String>,
}

impl ExecutionReport {
    /// Build a report from raw process output, applying the harness protocol.
    pub fn from_output(stdout: String, exit_code: i32, declared: &[String]) -> Self {
        let mut passed = Vec::new();
        let mut failed = Vec::new();
        for line in stdout.lines() {
            if let Some(name) = line.strip_prefix("PASS ") {
                passed.push(name.trim().to_string());
            } else if let Some(name) = line.strip_prefix("FAIL ") {
                failed.push(name.trim().to_string());
            }
        }
        for name in declared {
            if !passed.contains(name) && !failed.contains(name) {
                failed.push(name.clone());
            }
        }
        Self {
            stdout,
            exit_code,
            passed_tests: passed,
            failed_tests: failed,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && self.failed_tests.is_empty()
    }

    /// Derive the verdict this report implies.
    pub fn verdict(&self) -> Verdict {
        if self.succeeded() {
            return Verdict::pass(1.0);
        }
        let mut issues: Vec<Issue> = self
            .failed_tests
            .iter()
            .map(|t| Issue::defect(Severity::High, format!("test '{t}' failed")))
            .collect();
        if issues.is_empty() {
            let tail_start = self.stdout.len().saturating_sub(OUTPUT_TAIL);
            let tail = self.stdout.get(tail_start..).unwrap_or(&self.stdout);
            issues.push(Issue::defect(
                Severity::Critical,
                format!("process exited with code {}: {}", self.exit_code, tail.trim()),
            ));
        }
        Verdict::fail(issues, 1.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Executor
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    async fn execute(&self, source: &str, suite: &TestSuite) -> Result<ExecutionReport, SandboxError>;
}

/// Runs candidates in a child process under a wall-clock limit.
///
/// The child is killed when the limit expires.  CPU and memory limits are
/// left to the interpreter command (for example a `prlimit` or container
/// wrapper in `program`/`args`).
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: String,
    args: Vec<String>,
    time_limit: Duration,
}

impl ProcessExecutor {
    pub fn new(program: impl Into<String>, time_limit: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            time_limit,
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// `python3 -` with a 10 second limit.
    pub fn python() -> Self {
        Self::new("python3", Duration::from_secs(10)).with_arg("-")
    }
}

#[async_trait]
impl SandboxExecutor for ProcessExecutor {
    async fn execute(&self, source: &str, suite: &TestSuite) -> Result<ExecutionReport, SandboxError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        // The program is fed while stdout is drained; an interpreter that
        // runs code before reading all of stdin can fill its stdout pipe.
        let program = format!("{source}\n{}\n", suite.harness);
        let stdin = child.stdin.take();
        let writer = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(program.as_bytes()).await?;
                // stdin drops here so the interpreter sees EOF
            }
            Ok::<(), std::io::Error>(())
        });

        let output = match tokio::time::timeout(self.time_limit, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                // the child was killed on drop; the writer sees a closed pipe
                writer.abort();
                return Err(SandboxError::Timeout(self.time_limit));
            }
        };
        if let Ok(Err(e)) = writer.await {
            debug!(suite = %suite.id, error = %e, "interpreter closed stdin early");
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let exit_code = output.status.code().unwrap_or(-1);
        debug!(suite = %suite.id, exit_code, "sandbox run finished");
        Ok(ExecutionReport::from_output(stdout, exit_code, &suite.tests))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SandboxVerifier
// ─────────────────────────────────────────────────────────────────────────────

/// A [`Verifier`] whose verdicts come from running the task's test oracle.
pub struct SandboxVerifier<E> {
    executor: E,
    suites: HashMap<String, TestSuite>,
}

impl<E: SandboxExecutor> SandboxVerifier<E> {
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            suites: HashMap::new(),
        }
    }

    /// Register `suite` under its id.  Tasks refer to it through
    /// [`Task::oracle_id`].
    pub fn with_suite(mut self, suite: TestSuite) -> Self {
        self.suites.insert(suite.id.clone(), suite);
        self
    }

    pub fn suite(&self, id: &str) -> Option<&TestSuite> {
        self.suites.get(id)
    }
}

#[async_trait]
impl<E: SandboxExecutor> Verifier for SandboxVerifier<E> {
    fn name(&self) -> &str {
        "sandbox-verifier"
    }

    async fn verify(&self, candidate: &Candidate, task: &Task) -> Result<Verdict, CmvkError> {
        let oracle = task.oracle_id.as_deref().ok_or_else(|| {
            CmvkError::VerificationFailure(format!("task {} has no test oracle", task.id))
        })?;
        let suite = self.suites.get(oracle).ok_or_else(|| {
            CmvkError::VerificationFailure(format!("unknown test oracle '{oracle}'"))
        })?;
        let report = self.executor.execute(&candidate.source, suite).await.map_err(|e| {
            warn!(task = %task.id, error = %e, "sandbox execution failed");
            CmvkError::from(e)
        })?;
        Ok(report.verdict())
    }
}
