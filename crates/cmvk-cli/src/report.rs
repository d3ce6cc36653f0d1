//! Terminal and JSON rendering of batch results.

use colored::Colorize;
use serde_json::{Value, json};

use cmvk_runtime::{BaselineReport, BaselineSummary, BatchSummary, TaskReport};
use cmvk_types::{Attempt, EpisodeResult, TraceEvent, VerdictStatus};

/// One line per task.
pub fn task_line(report: &TaskReport) -> String {
    match &report.result {
        Ok(result) if result.is_accepted() => format!(
            "  {} {}  {}",
            "✓".green().bold(),
            report.task_id.bold(),
            format!(
                "accepted after {} attempt(s){}",
                result.attempts.len(),
                accepted_strategy(result)
            )
            .dimmed()
        ),
        Ok(result) => format!(
            "  {} {}  {}",
            "✗".yellow().bold(),
            report.task_id.bold(),
            format!(
                "exhausted after {} attempt(s); forbidden: {}",
                result.attempts.len(),
                forbidden_list(result)
            )
            .dimmed()
        ),
        Err(e) => format!("  {} {}  {}", "!".red().bold(), report.task_id.bold(), e.to_string().red()),
    }
}

fn accepted_strategy(result: &EpisodeResult) -> String {
    result
        .accepted_candidate
        .as_ref()
        .map(|c| format!(" [{} {}]", c.strategy, c.fingerprint.short()))
        .unwrap_or_default()
}

fn forbidden_list(result: &EpisodeResult) -> String {
    if result.forbidden_strategies.is_empty() {
        return "none".to_string();
    }
    result
        .forbidden_strategies
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Indented per-attempt lines for `--verbose`.
pub fn attempt_lines(result: &EpisodeResult) -> Vec<String> {
    result.attempts.iter().map(attempt_line).collect()
}

fn attempt_line(attempt: &Attempt) -> String {
    let status = match attempt.verdict.status {
        VerdictStatus::Pass => "PASS".green(),
        VerdictStatus::Fail => "FAIL".red(),
    };
    let strategy = attempt.strategy().map_or("-", |s| s.as_str());
    let mut line = format!("      #{} {} {}", attempt.index, status, strategy);
    if attempt.cache_hit {
        line.push_str(&format!(" {}", "(cached)".dimmed()));
    }
    if attempt.ban_triggered {
        line.push_str(&format!(" {}", "(banned)".yellow()));
    }
    if let Some(issue) = attempt.verdict.issues.first() {
        line.push_str(&format!(" – {}", issue.description));
    }
    line
}

pub fn summary_line(summary: &BatchSummary) -> String {
    format!(
        "  {} accepted, {} exhausted, {} errored of {} task(s)  ({} attempts, {} cache hits, {:.0}% accepted)",
        summary.accepted.to_string().green().bold(),
        summary.exhausted.to_string().yellow().bold(),
        summary.errored.to_string().red().bold(),
        summary.total,
        summary.attempts,
        summary.cache_hits,
        summary.acceptance_rate() * 100.0
    )
}

/// Control-arm counterpart of [`summary_line`].
pub fn baseline_line(summary: &BaselineSummary) -> String {
    format!(
        "  {} {} accepted of {} task(s) in one shot  ({} judged, {} generation failures, {:.0}% accepted)",
        "baseline:".dimmed(),
        summary.accepted.to_string().bold(),
        summary.total,
        summary.judged,
        summary.generation_failures,
        summary.acceptance_rate() * 100.0
    )
}

/// Machine-readable form of a batch, with the baseline arm when it ran.
pub fn to_json(reports: &[TaskReport], baseline: Option<&[BaselineReport]>) -> Value {
    let tasks: Vec<Value> = reports
        .iter()
        .map(|r| match &r.result {
            Ok(result) => json!({ "task": r.task_id, "result": result }),
            Err(e) => json!({ "task": r.task_id, "error": e.to_string() }),
        })
        .collect();
    let mut value = json!({
        "summary": BatchSummary::from_reports(reports),
        "tasks": tasks,
    });
    if let Some(baseline) = baseline {
        let arm: Vec<Value> = baseline
            .iter()
            .map(|r| match &r.result {
                Ok(result) => json!({ "task": r.task_id, "result": result }),
                Err(e) => json!({ "task": r.task_id, "error": e.to_string() }),
            })
            .collect();
        value["baseline"] = json!({
            "summary": BaselineSummary::from_reports(baseline),
            "tasks": arm,
        });
    }
    value
}

/// One line per replayed trace event.
pub fn event_line(event: &TraceEvent) -> String {
    match event {
        TraceEvent::Attempt(a) => format!(
            "  #{} {:?}{}{} {}",
            a.attempt_index,
            a.verdict_status,
            a.strategy_tag
                .as_ref()
                .map(|t| format!(" {t}"))
                .unwrap_or_default(),
            if a.cache_hit { " (cached)" } else { "" },
            a.timestamp.to_rfc3339()
        ),
        TraceEvent::Terminal(t) => format!(
            "  {:?} after {} attempt(s); forbidden: [{}]",
            t.outcome,
            t.total_attempts,
            t.final_forbidden_strategies
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}
