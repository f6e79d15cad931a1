//! Container runtime driven through the `docker` CLI.

use async_trait::async_trait;
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::debug;

use crate::config::DockerEndpoint;
use crate::model::ImageDescriptor;
use crate::traits::{ImageRuntime, RuntimeError};

/// `docker -H <endpoint> ...` invoker.
#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: String,
    host: String,
}

impl DockerCli {
    pub fn new(bin: impl Into<String>, endpoint: &DockerEndpoint) -> Self {
        Self {
            bin: bin.into(),
            host: endpoint.host_arg(),
        }
    }

    /// Base command with the daemon address applied.
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.bin);
        command
            .arg("-H")
            .arg(&self.host)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    async fn run(&self, args: &[&str]) -> std::io::Result<Output> {
        debug!(bin = %self.bin, host = %self.host, ?args, "Running docker");
        self.command().args(args).output().await
    }
}

/// True when every error line only reports an image that is already gone.
fn only_absent_images(stderr: &str) -> bool {
    let mut lines = stderr.lines().map(str::trim).filter(|l| !l.is_empty()).peekable();
    lines.peek().is_some() && lines.all(|l| l.contains("No such image"))
}

#[async_trait]
impl ImageRuntime for DockerCli {
    async fn pull(&self, image: &ImageDescriptor) -> Result<(), RuntimeError> {
        let output = self.run(&["pull", "--quiet", &image.reference]).await?;
        if !output.status.success() {
            return Err(RuntimeError::PullFailed {
                reference: image.reference.clone(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn remove(&self, images: &[ImageDescriptor]) -> Result<(), RuntimeError> {
        if images.is_empty() {
            return Ok(());
        }
        let mut args = vec!["rmi"];
        args.extend(images.iter().map(|d| d.reference.as_str()));

        let output = self.run(&args).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if only_absent_images(&stderr) {
            return Ok(());
        }
        Err(RuntimeError::RemoveFailed {
            references: images
                .iter()
                .map(|d| d.reference.as_str())
                .collect::<Vec<_>>()
                .join(" "),
            message: stderr.trim().to_string(),
        })
    }
}
