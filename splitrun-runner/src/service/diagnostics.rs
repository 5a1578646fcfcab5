//! Failure diagnostics
//!
//! Collects everything an operator needs to look at a failed worker while
//! its siblings are still running: sandbox metadata, sandbox log tail, the
//! tail of the worker's own log and a snapshot of host processes.

use colored::*;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

use crate::podman::SandboxRuntime;

/// Diagnostic bundle for one failed worker
#[derive(Debug, Clone)]
pub struct DiagnosticBundle {
    pub worker: String,
    pub exit_code: i32,
    pub sandbox_metadata: String,
    pub sandbox_log_tail: String,
    pub worker_log_tail: String,
    pub host_processes: String,
}

impl DiagnosticBundle {
    /// Gathers a bundle; every section degrades to an explanation on error
    pub async fn gather(
        runtime: &dyn SandboxRuntime,
        worker: &str,
        exit_code: i32,
        log_path: &Path,
        tail_lines: usize,
    ) -> Self {
        let sandbox_metadata = runtime
            .inspect(worker)
            .await
            .unwrap_or_else(|e| format!("<unavailable: {:#}>", e));

        let sandbox_log_tail = runtime
            .logs_tail(worker, tail_lines)
            .await
            .unwrap_or_else(|e| format!("<unavailable: {:#}>", e));

        let worker_log_tail = match tokio::fs::read_to_string(log_path).await {
            Ok(contents) => tail(&contents, tail_lines),
            Err(e) => format!("<unavailable: {}>", e),
        };

        Self {
            worker: worker.to_string(),
            exit_code,
            sandbox_metadata,
            sandbox_log_tail,
            worker_log_tail,
            host_processes: host_processes().await,
        }
    }

    /// Renders the bundle for the operator
    pub fn render(&self) -> String {
        let rule = "─".repeat(80);
        let mut out = String::new();

        out.push_str(&format!(
            "{}\n",
            format!("✗ Worker {} failed with exit code {}", self.worker, self.exit_code)
                .red()
                .bold()
        ));
        for (title, body) in [
            ("Sandbox metadata", &self.sandbox_metadata),
            ("Sandbox log", &self.sandbox_log_tail),
            ("Worker log", &self.worker_log_tail),
            ("Host processes", &self.host_processes),
        ] {
            out.push_str(&format!("{}\n", rule.dimmed()));
            out.push_str(&format!("{}\n", title.bold()));
            out.push_str(body.trim_end());
            out.push('\n');
        }
        out.push_str(&format!("{}\n", rule.dimmed()));
        out
    }

    /// Prints the bundle to stderr
    pub fn print(&self) {
        eprint!("{}", self.render());
    }
}

/// Last `lines` lines of `contents`
pub fn tail(contents: &str, lines: usize) -> String {
    let all: Vec<&str> = contents.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

async fn host_processes() -> String {
    match Command::new("ps")
        .args(["-eo", "pid,ppid,pcpu,pmem,etime,args"])
        .output()
        .await
    {
        Ok(output) => String::from_utf8_lossy(&output.stdout).to_string(),
        Err(e) => {
            debug!("Failed to snapshot host processes: {}", e);
            format!("<unavailable: {}>", e)
        }
    }
}
