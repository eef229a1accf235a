//! fenceref CLI - resolve references in text files and report token totals.
//!
//! ```text
//! main() -> load config -> PromptEngine::from_config -> run(command) -> shutdown
//! ```
//!
//! Logs go to `~/.fenceref/logs/fenceref.log` (falling back to
//! `./.fenceref/logs/fenceref.log`, then stderr) so stdout carries only the
//! command output.

mod args;

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::io::AsyncReadExt;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use fenceref_engine::{
    BlockId, BlockSummary, CacheTarget, FenceBlock, FencerefConfig, PromptEngine,
    ResolutionError, ResolutionResult, Signature, Snapshot, TaskState, fenceref_dir,
};

use crate::args::{Cli, Command};

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

fn open_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.fenceref/logs/fenceref.log
    if let Some(dir) = fenceref_dir() {
        candidates.push(dir.join("logs").join("fenceref.log"));
    }

    candidates.push(PathBuf::from(".fenceref").join("logs").join("fenceref.log"));

    candidates
}

fn load_config(path: Option<&Path>) -> Result<FencerefConfig> {
    match path {
        Some(path) => Ok(FencerefConfig::load_from(path)?),
        None => Ok(FencerefConfig::load()?.unwrap_or_default()),
    }
}

async fn read_input(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) if path != Path::new("-") => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display())),
        _ => {
            let mut input = String::new();
            tokio::io::stdin()
                .read_to_string(&mut input)
                .await
                .context("failed to read stdin")?;
            Ok(input)
        }
    }
}

fn report_errors(result: &ResolutionResult) {
    for error in &result.errors {
        eprintln!("warning: {}", error.marker);
    }
}

async fn run(engine: &PromptEngine, snapshot: Snapshot, command: Command) -> Result<()> {
    match command {
        Command::Resolve { path, json } => {
            let text = read_input(path.as_deref()).await?;
            let (result, all_failed) = match engine.resolve(&text, &snapshot).await {
                Ok(result) => (result, false),
                Err(ResolutionError::AllReferencesFailed { result }) => (*result, true),
                Err(e) => return Err(e.into()),
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(result.resolved_content.as_bytes())?;
                stdout.flush()?;
                report_errors(&result);
            }
            if all_failed {
                bail!("all {} references failed to resolve", result.errors.len());
            }
        }

        Command::Count { path } => {
            let text = read_input(path.as_deref()).await?;
            println!("{}", engine.count_tokens(&text)?);
        }

        Command::Invalidate { signature, all } => {
            let target = match signature {
                Some(raw) if !all => CacheTarget::Signature(Signature::parse(&raw)?),
                _ => CacheTarget::All,
            };
            let removed = engine.invalidate_cache(&target)?;
            println!("removed {removed} cached entries");
        }

        Command::Refresh { paths, priority } => {
            let mut ids = Vec::with_capacity(paths.len());
            for path in &paths {
                let content = read_input(Some(path)).await?;
                let id = BlockId::new(path.display().to_string());
                engine.register_block(FenceBlock::new(id.clone(), content));
                ids.push(id);
            }

            let task = engine.refresh(ids, priority.into(), snapshot)?;
            let Some(status) = engine.wait_for_task(task).await else {
                bail!("refresh task {task} disappeared");
            };

            match (status.state, status.outcome) {
                (TaskState::Completed, Some(outcome)) => {
                    for summary in &outcome.blocks {
                        print_summary(summary);
                    }
                    for failed in &outcome.failed_blocks {
                        eprintln!("warning: {} not refreshed: {}", failed.id, failed.message);
                    }
                    println!("total: {} tokens", outcome.global_total);
                }
                (state, _) => bail!(
                    "refresh task {task} {state}: {}",
                    status.error.as_deref().unwrap_or("no detail")
                ),
            }
        }
    }
    Ok(())
}

fn print_summary(summary: &BlockSummary) {
    let approximate = if summary.approximate { " (approximate)" } else { "" };
    print!(
        "{}: {} tokens = {} content + {} from {} references{approximate}",
        summary.id,
        summary.total_tokens,
        summary.base_content_tokens,
        summary.reference_tokens,
        summary.distinct_references,
    );
    if summary.failed_references > 0 {
        print!(", {} failed", summary.failed_references);
    }
    println!();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = load_config(cli.config.as_deref())?;
    let engine = PromptEngine::from_config(&config)?;

    let outcome = run(&engine, config.snapshot(), cli.command).await;
    engine.shutdown().await;
    outcome
}
