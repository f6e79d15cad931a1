//! Extraction by running inspection scripts inside each pulled image.
//!
//! Every regular file of the scripts directory is bind-mounted read-only into
//! a throwaway container of the image and executed; its exit code and output
//! become one entry of the image's report.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::backends::docker::DockerCli;
use crate::model::{ExtractionResults, ImageDescriptor, ImageReport, ScriptOutput};
use crate::traits::{ExtractionError, Extractor};

const MOUNT_POINT: &str = "/collector-scripts";

pub struct ScriptExtractor {
    docker: DockerCli,
    scripts_dir: PathBuf,
}

impl ScriptExtractor {
    pub fn new(docker: DockerCli, scripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            docker,
            scripts_dir: scripts_dir.into(),
        }
    }

    /// Absolute scripts directory and the script file names, sorted.
    async fn scripts(&self) -> Result<(PathBuf, Vec<String>), ExtractionError> {
        let unavailable = |e: std::io::Error| {
            ExtractionError::ScriptsUnavailable(format!("{}: {}", self.scripts_dir.display(), e))
        };
        let dir = tokio::fs::canonicalize(&self.scripts_dir)
            .await
            .map_err(unavailable)?;

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(unavailable)?;
        while let Some(entry) = entries.next_entry().await.map_err(unavailable)? {
            if entry.file_type().await.map_err(unavailable)?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();

        if names.is_empty() {
            return Err(ExtractionError::ScriptsUnavailable(format!(
                "no scripts in {}",
                dir.display()
            )));
        }
        Ok((dir, names))
    }

    async fn run_script(
        &self,
        dir: &Path,
        script: &str,
        image: &ImageDescriptor,
    ) -> Result<ScriptOutput, ExtractionError> {
        let volume = format!("{}:{}:ro", dir.display(), MOUNT_POINT);
        let script_path = format!("{}/{}", MOUNT_POINT, script);

        let output = self
            .docker
            .command()
            .args(["run", "--rm", "--entrypoint", "", "-v", volume.as_str()])
            .arg(&image.reference)
            .arg(&script_path)
            .output()
            .await?;

        Ok(ScriptOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl Extractor for ScriptExtractor {
    async fn extract(&self, batch: &[ImageDescriptor]) -> Result<ExtractionResults, ExtractionError> {
        let (dir, scripts) = self.scripts().await?;
        let mut results = ExtractionResults::new();

        for image in batch {
            let mut report = ImageReport::new(image);
            for script in &scripts {
                let output = self.run_script(&dir, script, image).await?;
                if !output.succeeded() {
                    warn!(
                        image = %image.image,
                        script = %script,
                        exit_code = ?output.exit_code,
                        "Script failed"
                    );
                }
                report.outputs.insert(script.clone(), output);
            }
            debug!(image = %image.image, scripts = scripts.len(), "Extracted image");
            results.insert(image.image.clone(), report);
        }

        Ok(results)
    }

    fn name(&self) -> &str {
        "scripts"
    }
}
