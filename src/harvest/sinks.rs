//! Output sinks and the fan-out that feeds them.

use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{CollectorConfig, SinkKind};
use crate::model::{ExtractionResults, ImageDescriptor};
use crate::traits::{Sink, SinkError};

/// Outcome of delivering one batch to every sink.
#[derive(Debug, Default, Clone)]
pub struct FanOutReport {
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
}

impl FanOutReport {
    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Delivers every batch to all configured sinks, in order.
///
/// A failing sink is logged and skipped; it never stops delivery to the
/// sinks after it.
#[derive(Clone, Default)]
pub struct SinkFanOut {
    sinks: Vec<Arc<dyn Sink>>,
}

impl SinkFanOut {
    pub fn new(sinks: Vec<Arc<dyn Sink>>) -> Self {
        Self { sinks }
    }

    /// Instantiates the sinks selected in the configuration.
    pub fn from_config(config: &CollectorConfig) -> Self {
        for name in &config.unknown_sinks {
            warn!(sink = %name, "No such output sink, ignoring");
        }

        let sinks = config
            .sinks
            .iter()
            .filter_map(|kind| -> Option<Arc<dyn Sink>> {
                match kind {
                    SinkKind::File => {
                        Some(Arc::new(FileSink::new(&config.out_dir)) as Arc<dyn Sink>)
                    }
                    SinkKind::Remote => config.remote_endpoint.as_ref().map(|endpoint| {
                        Arc::new(RemoteSink::new(endpoint, config.remote_token.clone()))
                            as Arc<dyn Sink>
                    }),
                }
            })
            .collect();
        Self::new(sinks)
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub async fn deliver(&self, results: &ExtractionResults) -> FanOutReport {
        let mut report = FanOutReport::default();
        for sink in &self.sinks {
            match sink.deliver(results).await {
                Ok(()) => {
                    debug!(sink = sink.name(), reports = results.len(), "Delivered results");
                    report.delivered.push(sink.name().to_string());
                }
                Err(e) => {
                    warn!(
                        sink = sink.name(),
                        images = ?results.keys().map(|id| id.as_str()).collect::<Vec<_>>(),
                        error = %e,
                        "Failed to deliver results"
                    );
                    report.failed.push(sink.name().to_string());
                }
            }
        }
        report
    }

    pub async fn deliver_metadata(&self, descriptors: &[ImageDescriptor]) -> FanOutReport {
        let mut report = FanOutReport::default();
        for sink in &self.sinks {
            match sink.deliver_metadata(descriptors).await {
                Ok(()) => report.delivered.push(sink.name().to_string()),
                Err(e) => {
                    warn!(
                        sink = sink.name(),
                        descriptors = descriptors.len(),
                        error = %e,
                        "Failed to save image metadata"
                    );
                    report.failed.push(sink.name().to_string());
                }
            }
        }
        report
    }
}

/// Writes one JSON document per image under `<out_dir>/images`.
///
/// Re-delivering an image overwrites its document, so retries are harmless.
pub struct FileSink {
    out_dir: PathBuf,
}

impl FileSink {
    pub fn new(out_dir: &Path) -> Self {
        Self {
            out_dir: out_dir.to_path_buf(),
        }
    }

    async fn write_json(&self, path: PathBuf, body: Vec<u8>) -> Result<(), SinkError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// Maps an identity such as `sha256:abc` onto a safe file name.
pub fn file_name_for(id: &str) -> String {
    id.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn deliver(&self, results: &ExtractionResults) -> Result<(), SinkError> {
        let images_dir = self.out_dir.join("images");
        for (image, report) in results {
            let path = images_dir.join(format!("{}.json", file_name_for(image.as_str())));
            self.write_json(path, serde_json::to_vec_pretty(report)?).await?;
        }
        Ok(())
    }

    async fn deliver_metadata(&self, descriptors: &[ImageDescriptor]) -> Result<(), SinkError> {
        let name = format!("{}.json", Utc::now().format("%Y%m%dT%H%M%S%.6fZ"));
        let path = self.out_dir.join("metadata").join(name);
        self.write_json(path, serde_json::to_vec_pretty(descriptors)?).await
    }
}

/// Forwards results to a remote collection service over HTTP.
pub struct RemoteSink {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl RemoteSink {
    pub fn new(endpoint: &str, token: Option<String>) -> Self {
        info!(endpoint = %endpoint, "Remote sink enabled");
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        }
    }

    async fn post<T: serde::Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<(), SinkError> {
        let url = format!("{}/{}", self.endpoint, path);
        let mut request = self.client.post(&url).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SinkError::Remote(format!("{}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(SinkError::Rejected {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for RemoteSink {
    fn name(&self) -> &str {
        "remote"
    }

    async fn deliver(&self, results: &ExtractionResults) -> Result<(), SinkError> {
        self.post("images", results).await
    }

    async fn deliver_metadata(&self, descriptors: &[ImageDescriptor]) -> Result<(), SinkError> {
        self.post("metadata", descriptors).await
    }
}
