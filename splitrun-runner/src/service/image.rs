//! Worker image acquisition
//!
//! Makes sure the worker image exists locally before any sandbox is
//! launched. Build failures are retried forever with a fixed delay; any
//! other failure aborts the run.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ImageError {
    /// Building the image failed; worth retrying
    #[error("image build failed: {0}")]
    Build(String),

    /// The image is neither present nor obtainable
    #[error("image unavailable: {0}")]
    Unavailable(String),

    #[error("failed to run image tooling: {0}")]
    Io(#[from] std::io::Error),
}

/// Source of worker images
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Ensures the image `tag` is available locally
    async fn ensure(&self, tag: &str) -> Result<(), ImageError>;
}

/// Acquires an image, retrying build failures with a fixed delay
///
/// There is no attempt limit: the caller decides when to give up by
/// cancelling the run.
pub async fn acquire_image(
    source: &dyn ImageSource,
    tag: &str,
    retry_delay: Duration,
) -> Result<(), ImageError> {
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match source.ensure(tag).await {
            Ok(()) => {
                if attempt > 1 {
                    info!("Image {} available after {} attempt(s)", tag, attempt);
                }
                return Ok(());
            }
            Err(ImageError::Build(reason)) => {
                warn!(
                    "Building image {} failed (attempt {}): {}",
                    tag, attempt, reason
                );
                warn!("Retrying in {:?}...", retry_delay);
                tokio::time::sleep(retry_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Podman-backed image source
///
/// Uses a local image if present, otherwise builds it from the configured
/// context, otherwise pulls it.
pub struct PodmanImageSource {
    build_context: Option<PathBuf>,
    containerfile: Option<PathBuf>,
}

impl PodmanImageSource {
    pub fn new(build_context: Option<PathBuf>, containerfile: Option<PathBuf>) -> Self {
        Self {
            build_context,
            containerfile,
        }
    }

    async fn exists(&self, tag: &str) -> Result<bool, ImageError> {
        let status = Command::new("podman")
            .args(["image", "exists", tag])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        Ok(status.success())
    }
}

#[async_trait]
impl ImageSource for PodmanImageSource {
    async fn ensure(&self, tag: &str) -> Result<(), ImageError> {
        if self.exists(tag).await? {
            debug!("Image {} already present", tag);
            return Ok(());
        }

        let mut command = Command::new("podman");
        command.stdin(Stdio::null());

        let building = if let Some(context) = &self.build_context {
            info!("Building image {} from {}", tag, context.display());
            command.args(["build", "-t", tag]);
            if let Some(file) = &self.containerfile {
                command.arg("-f").arg(file);
            }
            command.arg(context);
            true
        } else {
            info!("Pulling image {}", tag);
            command.args(["pull", tag]);
            false
        };

        let output = command.output().await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if building {
            Err(ImageError::Build(stderr))
        } else {
            Err(ImageError::Unavailable(stderr))
        }
    }
}
