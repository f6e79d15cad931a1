use crate::model::{ExtractionResults, ImageDescriptor};
use crate::traits::{ExtractionError, Extractor};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, instrument};

/// Hands one batch at a time to the extraction mechanism.
pub struct ExtractionDispatcher {
    extractor: Arc<dyn Extractor>,
    stage_timeout: Duration,
}

impl ExtractionDispatcher {
    /// Default timeout: 5 minutes per batch.
    pub fn new(extractor: Arc<dyn Extractor>) -> Self {
        Self {
            extractor,
            stage_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_timeout(mut self, stage_timeout: Duration) -> Self {
        self.stage_timeout = stage_timeout;
        self
    }

    /// Extracts the whole batch in one call. An elapsed timeout fails the
    /// whole batch.
    #[instrument(skip(self, batch), fields(extractor = self.extractor.name(), images = batch.len()))]
    pub async fn dispatch(
        &self,
        batch: &[ImageDescriptor],
    ) -> Result<ExtractionResults, ExtractionError> {
        info!("Starting extraction");
        let start = std::time::Instant::now();

        let results = timeout(self.stage_timeout, self.extractor.extract(batch))
            .await
            .map_err(|_| ExtractionError::Timeout(self.stage_timeout.as_secs()))??;

        info!(
            duration_ms = start.elapsed().as_millis() as u64,
            reports = results.len(),
            "Finished extraction"
        );
        Ok(results)
    }
}
