//! Scoped teardown of live workers
//!
//! Every sandbox is registered here as soon as it starts and released once
//! the aggregator has removed it. Whatever is still registered when the
//! guard is dropped gets its process group terminated and its sandbox
//! force-removed, on every exit path: normal return, early error, or the
//! run future being dropped on interrupt.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::podman::SandboxRuntime;

#[derive(Debug)]
struct LiveWorker {
    name: String,
    process_group: Option<u32>,
}

type LiveList = Arc<Mutex<Vec<LiveWorker>>>;

fn lock(live: &LiveList) -> MutexGuard<'_, Vec<LiveWorker>> {
    live.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the release of every sandbox started during one run
pub struct TeardownGuard {
    runtime: Arc<dyn SandboxRuntime>,
    live: LiveList,
}

/// Handle that forgets a worker's process group once it has been reaped
///
/// Held by the task waiting on the worker, so the group id is dropped
/// before the kernel can hand it to an unrelated process.
#[derive(Clone)]
pub struct ProcessTracker {
    live: LiveList,
}

impl ProcessTracker {
    /// Forgets the process group of `name`, keeping its sandbox registered
    pub fn detach_process(&self, name: &str) {
        if let Some(worker) = lock(&self.live).iter_mut().find(|w| w.name == name) {
            worker.process_group = None;
        }
    }
}

impl TeardownGuard {
    pub fn new(runtime: Arc<dyn SandboxRuntime>) -> Self {
        Self {
            runtime,
            live: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Records a started sandbox
    pub fn register(&self, name: &str) {
        self.lock().push(LiveWorker {
            name: name.to_string(),
            process_group: None,
        });
    }

    /// Records the process group of the worker running in `name`
    pub fn attach_process(&self, name: &str, pid: u32) {
        if let Some(worker) = self.lock().iter_mut().find(|w| w.name == name) {
            worker.process_group = Some(pid);
        }
    }

    /// Tracker for process exits, usable from spawned tasks
    pub fn process_tracker(&self) -> ProcessTracker {
        ProcessTracker {
            live: Arc::clone(&self.live),
        }
    }

    /// Forgets a sandbox that has been removed
    pub fn release(&self, name: &str) {
        self.lock().retain(|worker| worker.name != name);
    }

    /// Number of sandboxes not yet released
    #[cfg(test)]
    pub fn live_count(&self) -> usize {
        self.lock().len()
    }

    /// Process group still registered for `name`
    #[cfg(test)]
    pub fn process_group(&self, name: &str) -> Option<u32> {
        self.lock()
            .iter()
            .find(|w| w.name == name)
            .and_then(|w| w.process_group)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<LiveWorker>> {
        lock(&self.live)
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        let live = std::mem::take(&mut *self.lock());
        if live.is_empty() {
            return;
        }

        warn!("Tearing down {} live worker(s)", live.len());

        for worker in live {
            if let Some(pgid) = worker.process_group {
                terminate_group(pgid);
            }
            self.runtime.remove_blocking(&worker.name);
            debug!("Worker {} torn down", worker.name);
        }
    }
}

#[cfg(unix)]
fn terminate_group(pgid: u32) {
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        // ESRCH: the group already exited
        debug!(
            "killpg({}) failed: {}",
            pgid,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn terminate_group(pgid: u32) {
    warn!("Process group termination unsupported; worker {} left to the engine", pgid);
}
