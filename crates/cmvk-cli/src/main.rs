//! `cmvk` – Cross-Model Verification Kernel command line.
//!
//! ```text
//! cmvk run tasks.json                      # offline Null collaborators
//! CMVK_BASE_URL=http://localhost:11434 cmvk run tasks.json --trace-db runs.db
//! cmvk run tasks.json --suites suites.json # verdicts from running tests
//! cmvk run tasks.json --baseline           # also one-shot generation, for comparison
//! cmvk replay runs.db                      # list recorded episodes
//! cmvk init                                # write ~/.cmvk/config.toml
//! ```
//!
//! Configuration comes from `~/.cmvk/config.toml` (or `--config`), then
//! `CMVK_*` environment variables, then command-line flags.

mod config;
mod report;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tracing::{info, warn};
use uuid::Uuid;

use cmvk_memory::{JsonlRecorder, TeeRecorder, TraceStore};
use cmvk_runtime::throttle;
use cmvk_runtime::{
    Arbiter, BaselineSummary, BatchRunner, BatchSummary, FingerprintMode, Generator, LlmDriver, LlmGenerator,
    LlmVerifier, NullGenerator, NullVerifier, ProcessExecutor, SandboxVerifier, Task, TestSuite,
    Throttled, Verifier, init_tracing,
};

#[derive(Parser, Debug)]
#[command(name = "cmvk", version, about = "Adversarial generate/verify arbiter for code solutions")]
struct Cli {
    /// Config file (defaults to ~/.cmvk/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every task in a JSON file through the arbiter.
    Run(RunArgs),
    /// Print episodes recorded in a SQLite trace store.
    Replay {
        db: PathBuf,
        /// Only this episode; all episodes when omitted.
        episode: Option<Uuid>,
    },
    /// Write the effective configuration to the config file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// JSON array of tasks: `[{"id": "...", "statement": "...", "constraints": [], "oracle_id": null}]`.
    tasks: PathBuf,

    /// JSON array of test suites.  When given, verdicts come from running
    /// each task's oracle suite instead of a reviewing model.
    #[arg(long)]
    suites: Option<PathBuf>,

    #[arg(long)]
    max_loops: Option<u32>,

    #[arg(long)]
    ban_threshold: Option<u32>,

    #[arg(long)]
    concurrency: Option<usize>,

    /// Fingerprint whitespace- and comment-normalised source.
    #[arg(long)]
    normalized: bool,

    /// Append trace events to a JSON-lines file.
    #[arg(long)]
    trace_jsonl: Option<PathBuf>,

    /// Store trace events in a SQLite database.
    #[arg(long)]
    trace_db: Option<PathBuf>,

    /// Ignore configured models and use the Null collaborators.
    #[arg(long)]
    offline: bool,

    /// Also run the baseline arm (one generation per task, judged once by
    /// the same Verifier) and report its acceptance rate alongside.
    #[arg(long)]
    baseline: bool,

    /// Print results as JSON instead of a summary.
    #[arg(long)]
    json: bool,

    /// Show every attempt.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let _telemetry = init_tracing("cmvk");

    let path = cli.config.clone().unwrap_or_else(config::config_path);
    let cfg = config::load_or_default(&path).map_err(anyhow::Error::msg)?;

    match cli.command {
        Command::Run(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start the async runtime")?;
            runtime.block_on(run(cfg, args))
        }
        Command::Replay { db, episode } => replay(&db, episode),
        Command::Init { force } => init(&cfg, &path, force),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// run
// ─────────────────────────────────────────────────────────────────────────────

async fn run(mut cfg: config::Config, args: RunArgs) -> Result<ExitCode> {
    if let Some(n) = args.max_loops {
        cfg.max_loops = n;
    }
    if let Some(n) = args.ban_threshold {
        cfg.ban_threshold = n;
    }
    if let Some(n) = args.concurrency {
        cfg.concurrency = n;
    }
    if args.normalized {
        cfg.fingerprint_mode = FingerprintMode::Normalized;
    }
    if args.trace_jsonl.is_some() {
        cfg.trace_jsonl = args.trace_jsonl.clone();
    }
    if args.trace_db.is_some() {
        cfg.trace_db = args.trace_db.clone();
    }
    let use_models = cfg.uses_models() && !args.offline;

    let tasks: Vec<Task> = read_json(&args.tasks).context("failed to load tasks")?;
    if tasks.is_empty() {
        bail!("{} contains no tasks", args.tasks.display());
    }

    let (generator, verifier) = collaborators(&cfg, use_models, args.suites.as_deref())?;
    if !use_models {
        warn!("no model endpoint configured; using offline Null collaborators");
    }

    let mut arbiter = Arbiter::new(generator, verifier, cfg.to_arbiter_config())?;
    let recorder = recorder(&cfg)?;
    if !recorder.is_empty() {
        arbiter = arbiter.with_recorder(recorder);
    }

    info!(tasks = tasks.len(), models = use_models, "starting batch");
    let runner = BatchRunner::new(Arc::new(arbiter), cfg.concurrency);
    let baseline = if args.baseline {
        Some(runner.run_baseline(tasks.clone(), true).await)
    } else {
        None
    };
    let reports = runner.run(tasks).await;
    let summary = BatchSummary::from_reports(&reports);

    if args.json {
        let value = report::to_json(&reports, baseline.as_deref());
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!();
        for r in &reports {
            println!("{}", report::task_line(r));
            if args.verbose
                && let Ok(result) = &r.result
            {
                for line in report::attempt_lines(result) {
                    println!("{line}");
                }
            }
        }
        println!();
        println!("{}", report::summary_line(&summary));
        if let Some(baseline) = &baseline {
            println!("{}", report::baseline_line(&BaselineSummary::from_reports(baseline)));
        }
        println!();
    }

    Ok(if summary.accepted == summary.total {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Pick the Generator and Verifier for this run.
fn collaborators(
    cfg: &config::Config,
    use_models: bool,
    suites: Option<&Path>,
) -> Result<(Arc<dyn Generator>, Arc<dyn Verifier>)> {
    let mut generator: Arc<dyn Generator> = Arc::new(NullGenerator);
    let mut verifier: Arc<dyn Verifier> = Arc::new(NullVerifier);

    if use_models && let Some(base_url) = cfg.base_url.as_deref() {
        generator = Arc::new(LlmGenerator::new(driver(cfg, base_url, &cfg.generator_model)));
        verifier = Arc::new(LlmVerifier::new(driver(cfg, base_url, &cfg.verifier_model)));
    }

    if let Some(path) = suites {
        let suites: Vec<TestSuite> = read_json(path).context("failed to load test suites")?;
        let sandbox = suites
            .into_iter()
            .fold(SandboxVerifier::new(ProcessExecutor::python()), |v, s| v.with_suite(s));
        verifier = Arc::new(sandbox);
    }

    if let Some(rate) = cfg.requests_per_minute {
        let limiter = throttle::per_minute(rate)?;
        generator = Arc::new(Throttled::new(generator, limiter.clone()));
        verifier = Arc::new(Throttled::new(verifier, limiter));
    }

    Ok((generator, verifier))
}

fn driver(cfg: &config::Config, base_url: &str, model: &str) -> LlmDriver {
    let driver = LlmDriver::new(base_url, model);
    if cfg.api_key.is_empty() {
        driver
    } else {
        driver.with_api_key(cfg.api_key.as_str())
    }
}

fn recorder(cfg: &config::Config) -> Result<TeeRecorder> {
    let mut tee = TeeRecorder::new();
    if let Some(path) = &cfg.trace_jsonl {
        let sink = JsonlRecorder::open(path)
            .with_context(|| format!("failed to open trace log {}", path.display()))?;
        tee = tee.with(sink);
    }
    if let Some(path) = &cfg.trace_db {
        let store = TraceStore::open(path)
            .with_context(|| format!("failed to open trace store {}", path.display()))?;
        tee = tee.with(store);
    }
    Ok(tee)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("{} is not valid JSON", path.display()))
}

// ─────────────────────────────────────────────────────────────────────────────
// replay / init
// ─────────────────────────────────────────────────────────────────────────────

fn replay(db: &Path, episode: Option<Uuid>) -> Result<ExitCode> {
    if !db.exists() {
        bail!("no trace store at {}", db.display());
    }
    let store = TraceStore::open(db)?;
    let episodes = match episode {
        Some(id) => vec![id],
        None => store.episodes()?,
    };
    if episodes.is_empty() {
        println!("  {}", "No episodes recorded.".dimmed());
    }
    for id in episodes {
        let events = store.replay(id)?;
        if events.is_empty() {
            println!("  {} {}", "unknown episode".yellow(), id);
            continue;
        }
        println!("{}", id.to_string().bold());
        for event in &events {
            println!("{}", report::event_line(event));
        }
        if store.terminal(id)?.is_none() {
            println!("  {}", "(no terminal record: episode aborted)".red());
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn init(cfg: &config::Config, path: &Path, force: bool) -> Result<ExitCode> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    config::save_to(cfg, path).map_err(anyhow::Error::msg)?;
    println!(
        "  {} Config saved to {}",
        "✓".green().bold(),
        path.display().to_string().bold()
    );
    Ok(ExitCode::SUCCESS)
}
