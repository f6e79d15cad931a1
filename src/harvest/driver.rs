//! Outer collection loop.
//!
//! Each cycle moves through `Filtering -> Discovering -> Batching ->
//! Sleeping` and starts over. Shutdown is honoured between iterations only;
//! a running iteration always completes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::CollectorConfig;
use crate::error::Result;
use crate::executor::ExtractionDispatcher;
use crate::harvest::filter::RepoFilter;
use crate::harvest::ledger::Ledger;
use crate::harvest::pending::PendingQueue;
use crate::harvest::pipeline::BatchController;
use crate::harvest::sinks::SinkFanOut;
use crate::model::{DiscoverySet, ImageDescriptor, ImageId, ImageSet, RepoId};
use crate::traits::{Discovery, Extractor, ImageRuntime, Sleeper};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Filtering,
    Discovering,
    Batching,
    Sleeping,
}

/// Mutable collection state, owned by the driver for the process lifetime.
#[derive(Debug, Default)]
pub struct CollectorState {
    pub discovered: DiscoverySet,
    pub processed: ImageSet,
    pub pending: PendingQueue,

    /// Descriptors to retry on the next iteration, in retry order
    pub deferred: Vec<ImageDescriptor>,
    attempts: HashMap<ImageId, u32>,
}

impl CollectorState {
    pub fn new(processed: ImageSet) -> Self {
        Self {
            processed,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IterationSummary {
    pub iteration: u64,
    pub discovered: usize,
    pub pulled: usize,
    pub batches: usize,
    pub processed: usize,
    pub evicted: usize,
    pub deferred: usize,

    /// Images given up on after too many failed attempts
    pub dropped: usize,
}

pub struct IterationDriver {
    discovery: Arc<dyn Discovery>,
    controller: BatchController,
    sinks: SinkFanOut,
    sleeper: Arc<dyn Sleeper>,
    cli_repos: Vec<RepoId>,
    repo_list: PathBuf,
    poll_interval: Duration,
    max_attempts: u32,
    state: CollectorState,
    phase: DriverState,
    iterations: u64,
}

impl IterationDriver {
    /// Default configuration:
    /// - Poll interval: 60 seconds
    /// - Max attempts per image: 3
    /// - No command-line repos and no repo list file
    pub fn new(
        discovery: Arc<dyn Discovery>,
        controller: BatchController,
        sinks: SinkFanOut,
        sleeper: Arc<dyn Sleeper>,
        processed: ImageSet,
    ) -> Self {
        Self {
            discovery,
            controller,
            sinks,
            sleeper,
            cli_repos: Vec::new(),
            repo_list: PathBuf::new(),
            poll_interval: Duration::from_secs(60),
            max_attempts: 3,
            state: CollectorState::new(processed),
            phase: DriverState::Idle,
            iterations: 0,
        }
    }

    pub fn with_repos(mut self, cli_repos: Vec<RepoId>, repo_list: impl Into<PathBuf>) -> Self {
        self.cli_repos = cli_repos;
        self.repo_list = repo_list.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Wires the collaborators together and loads the ledger.
    ///
    /// # Errors
    ///
    /// Fails when the ledger exists but cannot be read.
    pub async fn start(
        config: &CollectorConfig,
        discovery: Arc<dyn Discovery>,
        runtime: Arc<dyn ImageRuntime>,
        extractor: Arc<dyn Extractor>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Self> {
        if config.retention_threshold > 0 && config.retention_threshold < config.batch_size {
            warn!(
                remove_thresh = config.retention_threshold,
                batch_size = config.batch_size,
                "Removal threshold is below batch size, images will be removed before extraction"
            );
        }

        let ledger = Ledger::new(&config.image_list);
        let processed = ledger.load().await?;

        let sinks = SinkFanOut::from_config(config);
        if sinks.is_empty() {
            warn!("No output sinks configured, results will be discarded");
        }

        let dispatcher = ExtractionDispatcher::new(extractor).with_timeout(config.extract_timeout);
        let controller = BatchController::new(runtime, dispatcher, sinks.clone(), ledger)
            .with_batch_size(config.batch_size)
            .with_retention_threshold(config.retention_threshold);

        Ok(Self::new(discovery, controller, sinks, sleeper, processed)
            .with_repos(config.cli_repos.clone(), &config.repo_list)
            .with_poll_interval(config.poll_interval)
            .with_max_attempts(config.max_attempts))
    }

    pub fn phase(&self) -> DriverState {
        self.phase
    }

    pub fn state(&self) -> &CollectorState {
        &self.state
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    fn transition(&mut self, next: DriverState) {
        debug!(from = ?self.phase, to = ?next, "Collector state change");
        self.phase = next;
    }

    /// Runs one filter/discover/batch cycle.
    pub async fn run_iteration(&mut self) -> IterationSummary {
        self.iterations += 1;
        let mut summary = IterationSummary {
            iteration: self.iterations,
            ..IterationSummary::default()
        };

        self.transition(DriverState::Filtering);
        let filter = RepoFilter::load(&self.cli_repos, &self.repo_list).await;

        self.transition(DriverState::Discovering);
        let fresh = match self.discovery.discover(&self.state.discovered, &filter).await {
            Ok((snapshot, fresh)) => {
                self.state.discovered = snapshot;
                fresh
            }
            Err(e) => {
                error!(error = %e, "Failed to get new image metadata");
                Vec::new()
            }
        };
        summary.discovered = fresh.len();
        if !fresh.is_empty() {
            info!(images = fresh.len(), "Discovered new images");
            self.sinks.deliver_metadata(&fresh).await;
        }

        let mut candidates = std::mem::take(&mut self.state.deferred);
        candidates.extend(fresh);
        if candidates.is_empty() {
            info!("Nothing new in this iteration");
            return summary;
        }

        self.transition(DriverState::Batching);
        let stats = self
            .controller
            .run_batch_pass(
                &candidates,
                &filter,
                &mut self.state.processed,
                &mut self.state.pending,
            )
            .await;

        summary.pulled = stats.pulled;
        summary.batches = stats.batches();
        summary.processed = stats.processed;
        summary.evicted = stats.evicted;

        let processed = &self.state.processed;
        self.state.attempts.retain(|image, _| !processed.contains(image));
        for descriptor in stats.deferred {
            let attempts = self.state.attempts.entry(descriptor.image.clone()).or_insert(0);
            *attempts += 1;
            if *attempts >= self.max_attempts {
                warn!(
                    repo = %descriptor.repo,
                    image = %descriptor.image,
                    attempts = *attempts,
                    "Giving up on image"
                );
                self.state.attempts.remove(&descriptor.image);
                summary.dropped += 1;
            } else {
                self.state.deferred.push(descriptor);
                summary.deferred += 1;
            }
        }

        info!(
            iteration = summary.iteration,
            pulled = summary.pulled,
            batches = summary.batches,
            processed = summary.processed,
            deferred = summary.deferred,
            "Iteration finished"
        );
        summary
    }

    /// Loops until `shutdown` turns true (or its sender goes away).
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.run_iteration().await;

            self.transition(DriverState::Sleeping);
            info!(seconds = self.poll_interval.as_secs(), "Looping after poll interval");
            let stop = tokio::select! {
                _ = self.sleeper.sleep(self.poll_interval) => false,
                changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
            };
            if stop {
                break;
            }
        }

        self.transition(DriverState::Idle);
        info!(iterations = self.iterations, "Collector stopped");
    }
}
