//! Orchestrator configuration
//!
//! Defines all configurable parameters for a partitioned run: what to run,
//! where sandboxes get their image from, where logs and artifacts go, and the
//! policy knobs around worker count and image acquisition.

use anyhow::Context;
use splitrun_core::domain::{JobCategory, SplitSpec};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Mount point of the shared output directory inside every sandbox
pub const SANDBOX_OUTPUT_DIR: &str = "/splitrun/out";

/// Mount point of the per-worker selection file inside the sandbox
pub const SANDBOX_SELECTION_FILE: &str = "/splitrun/selection.txt";

/// A host directory mounted into every sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

impl Mount {
    /// Argument for `podman run -v`
    pub fn to_volume_arg(&self) -> String {
        let mut arg = format!("{}:{}", self.host.display(), self.container);
        if self.read_only {
            arg.push_str(":ro");
        }
        arg
    }
}

impl FromStr for Mount {
    type Err = anyhow::Error;

    /// Parses `host:container[:ro]`
    fn from_str(s: &str) -> anyhow::Result<Self> {
        let mut parts = s.split(':');
        let (Some(host), Some(container)) = (parts.next(), parts.next()) else {
            anyhow::bail!("mount '{}' must be host:container[:ro]", s);
        };
        let read_only = match parts.next() {
            None => false,
            Some("ro") => true,
            Some("rw") => false,
            Some(other) => anyhow::bail!("mount '{}' has unknown option '{}'", s, other),
        };
        if parts.next().is_some() || host.is_empty() || !container.starts_with('/') {
            anyhow::bail!("mount '{}' must be host:/container[:ro]", s);
        }
        Ok(Self {
            host: PathBuf::from(host),
            container: container.to_string(),
            read_only,
        })
    }
}

/// One artifact kind collected from a successful worker
///
/// Copied from `source` inside the sandbox to
/// `<output_dir>/<kind>/<worker name>` on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSource {
    pub kind: String,
    pub source: String,
}

impl FromStr for ArtifactSource {
    type Err = anyhow::Error;

    /// Parses `kind=/path/in/sandbox`
    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (kind, source) = s
            .split_once('=')
            .with_context(|| format!("artifact '{}' must be kind=/path", s))?;
        if kind.is_empty() || kind.contains('/') || !source.starts_with('/') {
            anyhow::bail!("artifact '{}' must be kind=/absolute/path", s);
        }
        Ok(Self {
            kind: kind.to_string(),
            source: source.to_string(),
        })
    }
}

/// Parses a `KEY=VALUE` environment assignment
pub fn parse_env_var(s: &str) -> anyhow::Result<(String, String)> {
    let (key, value) = s
        .split_once('=')
        .with_context(|| format!("environment entry '{}' must be KEY=VALUE", s))?;
    if key.is_empty() {
        anyhow::bail!("environment entry '{}' has an empty key", s);
    }
    Ok((key.to_string(), value.to_string()))
}

/// Default artifact kinds: structured results, packaged logs, raw results
pub fn default_artifacts() -> Vec<ArtifactSource> {
    ["test-results", "logs", "results"]
        .into_iter()
        .map(|kind| ArtifactSource {
            kind: kind.to_string(),
            source: format!("{}/{}", SANDBOX_OUTPUT_DIR, kind),
        })
        .collect()
}

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Job category name, looked up in the category table
    pub category: String,

    /// Build target the tests run against (e.g. a JDK or toolchain label)
    pub target: String,

    /// Version tag of the code under test
    pub version: String,

    /// Coarse `K/N` split chosen by the caller
    pub split: String,

    /// Worker image tag
    pub image: String,

    /// Build context used when the image is missing locally
    pub build_context: Option<PathBuf>,

    /// Containerfile inside the build context
    pub containerfile: Option<PathBuf>,

    /// Shell command each worker runs inside its sandbox
    pub command: String,

    /// Host directory receiving collected artifacts
    pub output_dir: PathBuf,

    /// Host directory receiving one log file per worker
    pub log_dir: PathBuf,

    /// Scratch directory for per-worker selection files
    pub work_dir: PathBuf,

    /// Number of orchestrators expected to share the host
    pub tenancy_factor: u64,

    /// Worker count policy override; `None` uses the resource estimate
    pub workers: Option<usize>,

    /// Fixed delay between image build attempts
    pub image_retry_delay: Duration,

    /// Interval at which worker logs are polled for new output
    pub log_poll_interval: Duration,

    /// Extra mounts for every sandbox
    pub mounts: Vec<Mount>,

    /// Extra environment for every sandbox
    pub env: Vec<(String, String)>,

    /// Artifact kinds collected from successful workers
    pub artifacts: Vec<ArtifactSource>,

    /// Lines of log shown in a failure diagnostic bundle
    pub diagnostic_tail_lines: usize,

    /// Optional line-delimited test list to slice per worker
    pub selection: Option<PathBuf>,
}

impl Config {
    /// Creates a configuration with defaults for everything but the job
    pub fn new(category: String, split: String, image: String, command: String) -> Self {
        let base = PathBuf::from("build/splitrun");
        Self {
            category,
            target: "default".to_string(),
            version: "dev".to_string(),
            split,
            image,
            build_context: None,
            containerfile: None,
            command,
            output_dir: base.join("output"),
            log_dir: base.join("logs"),
            work_dir: base.join("work"),
            tenancy_factor: 1,
            workers: None,
            image_retry_delay: Duration::from_secs(30),
            log_poll_interval: Duration::from_millis(250),
            mounts: Vec::new(),
            env: Vec::new(),
            artifacts: default_artifacts(),
            diagnostic_tail_lines: 100,
            selection: None,
        }
    }

    /// Parsed coarse split
    pub fn outer_split(&self) -> splitrun_core::Result<SplitSpec> {
        self.split.parse()
    }

    /// Category table entry for this run
    pub fn job_category(&self) -> splitrun_core::Result<&'static JobCategory> {
        JobCategory::lookup(&self.category)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.job_category()?;
        self.outer_split()?;

        if self.image.is_empty() {
            anyhow::bail!("image cannot be empty");
        }

        if self.command.trim().is_empty() {
            anyhow::bail!("command cannot be empty");
        }

        if self.target.is_empty() || self.version.is_empty() {
            anyhow::bail!("target and version cannot be empty");
        }

        if self.tenancy_factor == 0 {
            anyhow::bail!("tenancy_factor must be at least 1");
        }

        if self.workers == Some(0) {
            anyhow::bail!("workers must be greater than 0");
        }

        if self.image_retry_delay.is_zero() {
            anyhow::bail!("image_retry_delay must be greater than 0");
        }

        if self.log_poll_interval.is_zero() {
            anyhow::bail!("log_poll_interval must be greater than 0");
        }

        if self.containerfile.is_some() && self.build_context.is_none() {
            anyhow::bail!("containerfile requires a build context");
        }

        if let Some(selection) = &self.selection
            && !selection.is_file()
        {
            anyhow::bail!("selection file {} does not exist", selection.display());
        }

        Ok(())
    }

    /// Creates the host-side log, output and scratch directories
    pub fn prepare_dirs(&self) -> anyhow::Result<()> {
        for dir in [&self.output_dir, &self.log_dir, &self.work_dir] {
            create_dir(dir)?;
        }
        Ok(())
    }
}

fn create_dir(dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::new(
            "standard".to_string(),
            "1/1".to_string(),
            "localhost/worker".to_string(),
            "run-tests".to_string(),
        )
    }

    #[test]
    fn test_default_config() {
        let config = config();
        assert_eq!(config.tenancy_factor, 1);
        assert_eq!(config.workers, None);
        assert_eq!(config.artifacts.len(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = config();

        config.category = "unknown".to_string();
        assert!(config.validate().is_err());
        config.category = "standard".to_string();

        config.split = "4/3".to_string();
        assert!(config.validate().is_err());
        config.split = "2/3".to_string();

        config.workers = Some(0);
        assert!(config.validate().is_err());
        config.workers = Some(2);
        assert!(config.validate().is_ok());

        config.tenancy_factor = 0;
        assert!(config.validate().is_err());
        config.tenancy_factor = 2;

        config.containerfile = Some(PathBuf::from("Containerfile"));
        assert!(config.validate().is_err());
        config.build_context = Some(PathBuf::from("."));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_mount() {
        let mount: Mount = "/data:/splitrun/data:ro".parse().unwrap();
        assert_eq!(mount.host, PathBuf::from("/data"));
        assert_eq!(mount.container, "/splitrun/data");
        assert!(mount.read_only);
        assert_eq!(mount.to_volume_arg(), "/data:/splitrun/data:ro");

        assert!("/data".parse::<Mount>().is_err());
        assert!("/data:relative".parse::<Mount>().is_err());
        assert!("/data:/x:zz".parse::<Mount>().is_err());
    }

    #[test]
    fn test_parse_artifact_and_env() {
        let artifact: ArtifactSource = "junit=/work/build/test/output".parse().unwrap();
        assert_eq!(artifact.kind, "junit");
        assert!("junit".parse::<ArtifactSource>().is_err());
        assert!("a/b=/x".parse::<ArtifactSource>().is_err());

        assert_eq!(
            parse_env_var("JAVA_OPTS=-Xmx1g -Da=b").unwrap(),
            ("JAVA_OPTS".to_string(), "-Xmx1g -Da=b".to_string())
        );
        assert!(parse_env_var("=x").is_err());
        assert!(parse_env_var("NOVALUE").is_err());
    }
}
