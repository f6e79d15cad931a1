//! Contracts of the external collaborators driven by the collection loop.
//!
//! The loop only distinguishes "call returned" from "call failed"; timeouts,
//! retries and transport details belong to the implementations.

use crate::harvest::RepoFilter;
use crate::model::{DiscoverySet, ExtractionResults, ImageDescriptor};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Registry request failed: {0}")]
    Request(String),
    #[error("Unexpected registry response from {url}: {message}")]
    Response { url: String, message: String },
    #[error("Registry authentication failed: {0}")]
    Auth(String),
}

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Failed to run container runtime: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("Pull of {reference} failed: {message}")]
    PullFailed { reference: String, message: String },
    #[error("Removal of {references} failed: {message}")]
    RemoveFailed { references: String, message: String },
}

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Scripts unavailable: {0}")]
    ScriptsUnavailable(String),
    #[error("Extraction timeout after {0}s")]
    Timeout(u64),
    #[error("I/O error during extraction: {0}")]
    Io(#[from] std::io::Error),
    #[error("Extraction failed: {0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Remote request failed: {0}")]
    Remote(String),
    #[error("Remote endpoint rejected delivery: {status}")]
    Rejected { status: u16 },
}

/// Finds images in the registry.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Returns the updated snapshot and the descriptors new relative to
    /// `snapshot`. A descriptor must not be reported as new twice for an
    /// unchanged registry.
    ///
    /// `scope` is a hint: when filtering is active an implementation may
    /// enumerate only the allowed repositories.
    async fn discover(
        &self,
        snapshot: &DiscoverySet,
        scope: &RepoFilter,
    ) -> Result<(DiscoverySet, Vec<ImageDescriptor>), DiscoveryError>;
}

/// Local container runtime primitives.
#[async_trait]
pub trait ImageRuntime: Send + Sync {
    /// Pulls the image. Pulling an image that is already local is a no-op.
    async fn pull(&self, image: &ImageDescriptor) -> Result<(), RuntimeError>;

    /// Removes local images. Removing an absent image is a no-op.
    async fn remove(&self, images: &[ImageDescriptor]) -> Result<(), RuntimeError>;
}

/// Runs the inspection scripts against a batch of pulled images.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Either returns a report per image (individual script failures are
    /// embedded in the reports) or fails for the whole batch.
    async fn extract(&self, batch: &[ImageDescriptor]) -> Result<ExtractionResults, ExtractionError>;

    fn name(&self) -> &str;
}

/// Output destination for extraction results.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, results: &ExtractionResults) -> Result<(), SinkError>;

    /// Receives descriptors as soon as they are discovered.
    async fn deliver_metadata(&self, _descriptors: &[ImageDescriptor]) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Waits between iterations.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real-time sleeper backed by `tokio::time`.
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
