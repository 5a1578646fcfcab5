//! Splitrun
//!
//! Runs one coarse slice of a test suite as several sandboxed workers on a
//! single host.
//!
//! Architecture:
//! - Configuration: command line and `SPLITRUN_*` environment
//! - Services: estimation, planning, image acquisition, launching, log
//!   streaming, diagnostics and aggregation
//! - Scheduler: the run lifecycle and teardown of everything it started
//!
//! The process exit code is the first non-zero worker exit code in
//! submission order, 1 for preflight errors and 130 on interrupt.

mod config;
mod job;
mod podman;
mod scheduler;
mod service;
mod shutdown;
#[cfg(test)]
mod testing;

use anyhow::Result;
use clap::Parser;
use colored::*;
use splitrun_core::domain::{JobCategory, RunResult};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{ArtifactSource, Config, Mount, default_artifacts, parse_env_var};
use crate::podman::{PodmanRuntime, check_podman_available};
use crate::scheduler::Orchestrator;
use crate::service::{PodmanImageSource, detect_budget};

/// Exit code for errors before any worker ran
const PREFLIGHT_EXIT_CODE: u8 = 1;

/// Exit code after an interrupt
const INTERRUPTED_EXIT_CODE: u8 = 130;

#[derive(Parser)]
#[command(name = "splitrun")]
#[command(about = "Run a slice of a test suite as parallel sandboxed workers", long_about = None)]
struct Cli {
    /// Job category (standard, long-running, heavy-resource)
    #[arg(long, env = "SPLITRUN_CATEGORY")]
    category: String,

    /// Coarse split to run, as K/N
    #[arg(long, env = "SPLITRUN_SPLIT", default_value = "1/1")]
    split: String,

    /// Worker image tag
    #[arg(long, env = "SPLITRUN_IMAGE")]
    image: String,

    /// Command run inside every sandbox
    #[arg(long, env = "SPLITRUN_COMMAND")]
    command: String,

    /// Build target label, part of every worker name
    #[arg(long, env = "SPLITRUN_TARGET", default_value = "default")]
    target: String,

    /// Version label, part of every worker name
    #[arg(long, env = "SPLITRUN_VERSION", default_value = "dev")]
    version: String,

    /// Build the image from this context when it is not present locally
    #[arg(long, env = "SPLITRUN_BUILD_CONTEXT")]
    build_context: Option<PathBuf>,

    /// Containerfile used with --build-context
    #[arg(long, env = "SPLITRUN_CONTAINERFILE")]
    containerfile: Option<PathBuf>,

    /// Host directory for collected artifacts
    #[arg(long, env = "SPLITRUN_OUTPUT_DIR", default_value = "build/splitrun/output")]
    output_dir: PathBuf,

    /// Host directory for worker logs
    #[arg(long, env = "SPLITRUN_LOG_DIR", default_value = "build/splitrun/logs")]
    log_dir: PathBuf,

    /// Host directory for per-run scratch files
    #[arg(long, env = "SPLITRUN_WORK_DIR", default_value = "build/splitrun/work")]
    work_dir: PathBuf,

    /// Number of independent runs sharing this host
    #[arg(long, env = "SPLITRUN_TENANCY", default_value_t = 1)]
    tenancy: u64,

    /// Override the estimated worker count
    #[arg(long, env = "SPLITRUN_WORKERS")]
    workers: Option<usize>,

    /// Seconds to wait before retrying a failed image build
    #[arg(long, env = "SPLITRUN_IMAGE_RETRY_SECS", default_value_t = 30)]
    image_retry_secs: u64,

    /// Milliseconds between worker log polls
    #[arg(long, env = "SPLITRUN_LOG_POLL_MS", default_value_t = 250)]
    log_poll_ms: u64,

    /// Extra mount, host:container[:ro]
    #[arg(long = "mount", value_name = "MOUNT")]
    mounts: Vec<Mount>,

    /// Extra sandbox environment, KEY=VALUE
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_var)]
    env: Vec<(String, String)>,

    /// Artifact to collect, kind=/path; replaces the defaults when given
    #[arg(long = "artifact", value_name = "KIND=PATH")]
    artifacts: Vec<ArtifactSource>,

    /// Lines of each log included in failure diagnostics
    #[arg(long, env = "SPLITRUN_DIAGNOSTIC_LINES", default_value_t = 100)]
    diagnostic_lines: usize,

    /// File listing selected tests, one per line
    #[arg(long, env = "SPLITRUN_SELECTION_FILE")]
    selection: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> Config {
        let mut config = Config::new(self.category, self.split, self.image, self.command);
        config.target = self.target;
        config.version = self.version;
        config.build_context = self.build_context;
        config.containerfile = self.containerfile;
        config.output_dir = self.output_dir;
        config.log_dir = self.log_dir;
        config.work_dir = self.work_dir;
        config.tenancy_factor = self.tenancy;
        config.workers = self.workers;
        config.image_retry_delay = Duration::from_secs(self.image_retry_secs);
        config.log_poll_interval = Duration::from_millis(self.log_poll_ms);
        config.mounts = self.mounts;
        config.env = self.env;
        config.artifacts = if self.artifacts.is_empty() {
            default_artifacts()
        } else {
            self.artifacts
        };
        config.diagnostic_tail_lines = self.diagnostic_lines;
        config.selection = self.selection;
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "splitrun=info,splitrun_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Cli::parse().into_config();

    let orchestrator = match prepare(&config) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(PREFLIGHT_EXIT_CODE);
        }
    };

    let budget = match detect_budget(config.tenancy_factor) {
        Ok(budget) => budget,
        Err(e) => {
            error!("Failed to measure host resources: {:#}", e);
            return ExitCode::from(PREFLIGHT_EXIT_CODE);
        }
    };

    let shutdown = match shutdown::install_shutdown_handler() {
        Ok(token) => token,
        Err(e) => {
            error!("Failed to install signal handlers: {}", e);
            return ExitCode::from(PREFLIGHT_EXIT_CODE);
        }
    };

    info!("Starting splitrun for category '{}'", config.category);

    // Dropping the run future tears down every live worker
    let outcome = tokio::select! {
        outcome = orchestrator.run(budget) => outcome,
        _ = shutdown.cancelled() => {
            warn!("Run interrupted");
            return ExitCode::from(INTERRUPTED_EXIT_CODE);
        }
    };

    match outcome {
        Ok(result) => {
            print_summary(&result);
            exit_code(&result)
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(PREFLIGHT_EXIT_CODE)
        }
    }
}

/// Validates the configuration and wires the orchestrator
fn prepare(config: &Config) -> Result<Orchestrator> {
    config.validate().map_err(|e| {
        anyhow::anyhow!(
            "{:#} (known categories: {})",
            e,
            JobCategory::names().join(", ")
        )
    })?;

    check_podman_available()?;

    Ok(Orchestrator::new(
        config.clone(),
        Arc::new(PodmanRuntime::new()),
        Arc::new(PodmanImageSource::new(
            config.build_context.clone(),
            config.containerfile.clone(),
        )),
    ))
}

fn exit_code(result: &RunResult) -> ExitCode {
    // Codes outside 0..=255 would wrap, possibly to success
    u8::try_from(result.overall_exit_code())
        .map(ExitCode::from)
        .unwrap_or(ExitCode::FAILURE)
}

fn print_summary(result: &RunResult) {
    println!();
    println!(
        "{} {}",
        "Run summary".bold(),
        format!("(finished {})", result.finished_at.format("%Y-%m-%d %H:%M:%S UTC")).dimmed()
    );
    for outcome in result.per_worker() {
        let marker = if outcome.exit_code == 0 {
            "✓".green()
        } else {
            "✗".red()
        };
        println!(
            "  {} {} ({}) exit {} - {} artifact(s)",
            marker,
            outcome.worker,
            outcome.split,
            outcome.exit_code,
            outcome.artifacts.len()
        );
    }

    if result.success() {
        println!("{}", "✓ All workers passed".green().bold());
    } else {
        println!(
            "{}",
            format!(
                "✗ Run failed with exit code {}",
                result.overall_exit_code()
            )
            .red()
            .bold()
        );
    }
}
