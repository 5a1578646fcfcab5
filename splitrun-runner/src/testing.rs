//! Test doubles shared by the runner's unit tests

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::process::{Child, Command};

use crate::podman::{SandboxRequest, SandboxRuntime};

/// Sandbox runtime that runs worker commands as plain `sh` children
///
/// The environment of the start request is applied to the child, so worker
/// commands see the same variables they would inside a sandbox.
#[derive(Default)]
pub struct FakeRuntime {
    requests: Mutex<HashMap<String, SandboxRequest>>,
    started: Mutex<Vec<String>>,
    inspected: Mutex<Vec<String>>,
    copied: Mutex<Vec<(String, String)>>,
    removed: Mutex<Vec<String>>,
    /// Sandboxes whose name contains one of these fail to start
    fail_start: Mutex<Vec<String>>,
    /// In-sandbox paths that exist for `copy_out`
    artifacts: Mutex<HashSet<String>>,
}

impl FakeRuntime {
    pub fn with_artifacts(sources: &[&str]) -> Self {
        let runtime = Self::default();
        runtime
            .artifacts
            .lock()
            .unwrap()
            .extend(sources.iter().map(|s| s.to_string()));
        runtime
    }

    pub fn fail_start_matching(&self, pattern: &str) {
        self.fail_start.lock().unwrap().push(pattern.to_string());
    }

    pub fn request(&self, name: &str) -> Option<SandboxRequest> {
        self.requests.lock().unwrap().get(name).cloned()
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn inspected(&self) -> Vec<String> {
        self.inspected.lock().unwrap().clone()
    }

    pub fn copied(&self) -> Vec<(String, String)> {
        self.copied.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxRuntime for FakeRuntime {
    async fn start(&self, request: &SandboxRequest) -> Result<String> {
        let fails = self
            .fail_start
            .lock()
            .unwrap()
            .iter()
            .any(|pattern| request.name.contains(pattern.as_str()));
        if fails {
            anyhow::bail!("image missing");
        }

        self.started.lock().unwrap().push(request.name.clone());
        self.requests
            .lock()
            .unwrap()
            .insert(request.name.clone(), request.clone());
        Ok(format!("id-{}", request.name))
    }

    async fn spawn_worker(&self, name: &str, command: &str, log: std::fs::File) -> Result<Child> {
        let env = self
            .request(name)
            .map(|request| request.env)
            .unwrap_or_default();
        let stderr = log.try_clone()?;

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .process_group(0)
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }

    async fn inspect(&self, name: &str) -> Result<String> {
        self.inspected.lock().unwrap().push(name.to_string());
        Ok(format!("{{\"Name\": \"{}\"}}", name))
    }

    async fn logs_tail(&self, _name: &str, _lines: usize) -> Result<String> {
        Ok(String::new())
    }

    async fn copy_out(&self, name: &str, source: &str, dest: &Path) -> Result<bool> {
        if !self.artifacts.lock().unwrap().contains(source) {
            return Ok(false);
        }
        std::fs::create_dir_all(dest)?;
        std::fs::write(dest.join("copied.txt"), source)?;
        self.copied
            .lock()
            .unwrap()
            .push((name.to_string(), source.to_string()));
        Ok(true)
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.removed.lock().unwrap().push(name.to_string());
        Ok(())
    }

    fn remove_blocking(&self, name: &str) {
        self.removed.lock().unwrap().push(name.to_string());
    }
}
