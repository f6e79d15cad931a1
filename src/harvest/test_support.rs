//! Recording collaborators for the collection loop tests.

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::harvest::RepoFilter;
use crate::model::{DiscoverySet, ExtractionResults, ImageDescriptor, ImageId, ImageReport};
use crate::traits::{
    Discovery, DiscoveryError, ExtractionError, Extractor, ImageRuntime, RuntimeError, Sink,
    SinkError, Sleeper,
};

/// Ordered record of every collaborator call, shared between mocks.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn record(&self, call: String) {
        self.0.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }
}

pub fn ids(descriptors: &[ImageDescriptor]) -> String {
    descriptors
        .iter()
        .map(|d| d.image.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

pub fn results_for(batch: &[ImageDescriptor]) -> ExtractionResults {
    batch
        .iter()
        .map(|d| (d.image.clone(), ImageReport::new(d)))
        .collect()
}

pub struct MockRuntime {
    log: CallLog,
    failing_pulls: Mutex<HashSet<ImageId>>,
    fail_removals: bool,
}

impl MockRuntime {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            failing_pulls: Mutex::new(HashSet::new()),
            fail_removals: false,
        }
    }

    pub fn failing_pull(self, image: &str) -> Self {
        self.failing_pulls.lock().unwrap().insert(ImageId::from(image));
        self
    }

    pub fn failing_removals(mut self) -> Self {
        self.fail_removals = true;
        self
    }
}

#[async_trait]
impl ImageRuntime for MockRuntime {
    async fn pull(&self, image: &ImageDescriptor) -> Result<(), RuntimeError> {
        self.log.record(format!("pull {} {}", image.repo, image.image));
        if self.failing_pulls.lock().unwrap().contains(&image.image) {
            return Err(RuntimeError::PullFailed {
                reference: image.reference.clone(),
                message: "manifest unknown".to_string(),
            });
        }
        Ok(())
    }

    async fn remove(&self, images: &[ImageDescriptor]) -> Result<(), RuntimeError> {
        self.log.record(format!("remove {}", ids(images)));
        if self.fail_removals {
            return Err(RuntimeError::RemoveFailed {
                references: ids(images),
                message: "conflict: image is in use".to_string(),
            });
        }
        Ok(())
    }
}

pub struct MockExtractor {
    log: CallLog,
    failures_left: Mutex<usize>,
}

impl MockExtractor {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            failures_left: Mutex::new(0),
        }
    }

    /// Fails the next `n` extraction calls.
    pub fn failing(self, n: usize) -> Self {
        *self.failures_left.lock().unwrap() = n;
        self
    }
}

#[async_trait]
impl Extractor for MockExtractor {
    async fn extract(&self, batch: &[ImageDescriptor]) -> Result<ExtractionResults, ExtractionError> {
        self.log.record(format!("extract {}", ids(batch)));
        let mut left = self.failures_left.lock().unwrap();
        if *left > 0 {
            *left -= 1;
            return Err(ExtractionError::Failed("script container exited".to_string()));
        }
        Ok(results_for(batch))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

pub struct RecordingSink {
    name: String,
    log: CallLog,
    fail: bool,
}

impl RecordingSink {
    pub fn new(name: &str, log: CallLog) -> Self {
        Self {
            name: name.to_string(),
            log,
            fail: false,
        }
    }

    pub fn failing(name: &str, log: CallLog) -> Self {
        Self {
            fail: true,
            ..Self::new(name, log)
        }
    }
}

#[async_trait]
impl Sink for RecordingSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, results: &ExtractionResults) -> Result<(), SinkError> {
        let images: Vec<_> = results.keys().map(ImageId::as_str).collect();
        self.log.record(format!("deliver {} {}", self.name, images.join(",")));
        if self.fail {
            return Err(SinkError::Rejected { status: 503 });
        }
        Ok(())
    }

    async fn deliver_metadata(&self, descriptors: &[ImageDescriptor]) -> Result<(), SinkError> {
        self.log.record(format!("metadata {} {}", self.name, descriptors.len()));
        Ok(())
    }
}

/// Returns one scripted listing per call (empty once exhausted) and merges
/// it into the snapshot.
pub struct ScriptedDiscovery {
    log: CallLog,
    listings: Mutex<VecDeque<Result<Vec<ImageDescriptor>, String>>>,
}

impl ScriptedDiscovery {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            listings: Mutex::new(VecDeque::new()),
        }
    }

    pub fn then_list(self, listing: Vec<ImageDescriptor>) -> Self {
        self.listings.lock().unwrap().push_back(Ok(listing));
        self
    }

    pub fn then_fail(self, message: &str) -> Self {
        self.listings
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
        self
    }
}

#[async_trait]
impl Discovery for ScriptedDiscovery {
    async fn discover(
        &self,
        snapshot: &DiscoverySet,
        _scope: &RepoFilter,
    ) -> Result<(DiscoverySet, Vec<ImageDescriptor>), DiscoveryError> {
        self.log.record(format!("discover {}", snapshot.len()));
        let next = self.listings.lock().unwrap().pop_front();
        match next {
            Some(Ok(listing)) => Ok(snapshot.merge(listing)),
            Some(Err(message)) => Err(DiscoveryError::Request(message)),
            None => Ok((snapshot.clone(), Vec::new())),
        }
    }
}

/// Records requested sleeps and returns immediately.
#[derive(Clone, Default)]
pub struct InstantSleeper {
    slept: Arc<Mutex<Vec<Duration>>>,
}

impl InstantSleeper {
    pub fn slept(&self) -> Vec<Duration> {
        self.slept.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap().push(duration);
        tokio::task::yield_now().await;
    }
}
