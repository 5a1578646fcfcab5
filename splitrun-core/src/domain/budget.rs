//! Host resource budget

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Bytes in one gibibyte
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Read-only snapshot of the host resources available to one run
///
/// Taken once before planning and never renegotiated while workers run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBudget {
    cpu_count: u64,
    memory_bytes: u64,
    tenancy_factor: u64,
}

impl ResourceBudget {
    /// Creates a budget, rejecting zero in any field
    ///
    /// # Arguments
    /// * `cpu_count` - Logical CPUs on the host
    /// * `memory_bytes` - Total host memory
    /// * `tenancy_factor` - Number of orchestrators expected to share the host
    pub fn new(cpu_count: u64, memory_bytes: u64, tenancy_factor: u64) -> Result<Self> {
        if cpu_count == 0 {
            return Err(Error::InvalidBudget("cpu_count must be positive".to_string()));
        }
        if memory_bytes == 0 {
            return Err(Error::InvalidBudget("memory_bytes must be positive".to_string()));
        }
        if tenancy_factor == 0 {
            return Err(Error::InvalidBudget(
                "tenancy_factor must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            cpu_count,
            memory_bytes,
            tenancy_factor,
        })
    }

    pub fn cpu_count(&self) -> u64 {
        self.cpu_count
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_bytes
    }

    pub fn tenancy_factor(&self) -> u64 {
        self.tenancy_factor
    }

    /// CPUs available to one worker when `workers` share this instance's slice
    pub fn cpus_per_worker(&self, workers: usize) -> f64 {
        self.cpu_count as f64 / (self.tenancy_factor * workers.max(1) as u64) as f64
    }

    /// Memory cap for one worker when `workers` share this instance's slice
    pub fn memory_per_worker(&self, workers: usize) -> u64 {
        self.memory_bytes / (self.tenancy_factor * workers.max(1) as u64)
    }

    /// Reads total memory from the contents of `/proc/meminfo`
    ///
    /// Returns the `MemTotal` value converted from kB to bytes.
    pub fn parse_meminfo(meminfo: &str) -> Option<u64> {
        meminfo.lines().find_map(|line| {
            let rest = line.strip_prefix("MemTotal:")?;
            let mut parts = rest.split_whitespace();
            let value = parts.next()?.parse::<u64>().ok()?;
            match parts.next() {
                Some("kB") | None => Some(value * 1024),
                _ => None,
            }
        })
    }
}
