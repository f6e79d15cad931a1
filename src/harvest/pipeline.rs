//! Batch pull-and-bound controller.
//!
//! This module provides the [`BatchController`] that turns a list of
//! candidate descriptors into extracted, delivered and ledgered batches:
//! - Repository filtering and duplicate suppression
//! - Pulling under a retention bound (oldest pulled images are evicted first)
//! - Fixed-size batching
//! - Extraction, sink fan-out and ledger append per batch

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::executor::ExtractionDispatcher;
use crate::harvest::filter::RepoFilter;
use crate::harvest::ledger::Ledger;
use crate::harvest::pending::PendingQueue;
use crate::harvest::sinks::SinkFanOut;
use crate::model::{ImageDescriptor, ImageId, ImageSet};
use crate::traits::ImageRuntime;

/// Statistics about one controller run.
#[derive(Debug, Default, Clone)]
pub struct PassStats {
    /// Successful pulls
    pub pulled: usize,

    /// Images handed to the runtime for removal
    pub evicted: usize,

    /// Size of every dispatched batch, in dispatch order
    pub batch_sizes: Vec<usize>,

    /// Images marked processed
    pub processed: usize,

    /// Images whose pull or extraction failed; they were not marked
    /// processed and may be retried later
    pub deferred: Vec<ImageDescriptor>,
}

impl PassStats {
    pub fn batches(&self) -> usize {
        self.batch_sizes.len()
    }
}

/// Pulls, batches, extracts and records images.
///
/// Default configuration:
/// - Batch size: 5
/// - Retention threshold: 10 pulled images
pub struct BatchController {
    runtime: Arc<dyn ImageRuntime>,
    dispatcher: ExtractionDispatcher,
    sinks: SinkFanOut,
    ledger: Ledger,
    batch_size: usize,
    retention_threshold: usize,
}

impl BatchController {
    pub fn new(
        runtime: Arc<dyn ImageRuntime>,
        dispatcher: ExtractionDispatcher,
        sinks: SinkFanOut,
        ledger: Ledger,
    ) -> Self {
        Self {
            runtime,
            dispatcher,
            sinks,
            ledger,
            batch_size: 5,
            retention_threshold: 10,
        }
    }

    /// Maximum number of images per batch. Must be greater than zero.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Number of pulled images kept locally before the oldest `threshold`
    /// are removed. Zero disables eviction.
    pub fn with_retention_threshold(mut self, threshold: usize) -> Self {
        self.retention_threshold = threshold;
        self
    }

    /// Processes `candidates` batch by batch until a pass yields nothing
    /// left to pull.
    ///
    /// An identity is considered at most once per call: after it was pulled
    /// (or failed to pull) it is skipped by every later batch, so the loop
    /// always terminates. Identities already in `processed` are never
    /// pulled.
    pub async fn run_batch_pass(
        &self,
        candidates: &[ImageDescriptor],
        filter: &RepoFilter,
        processed: &mut ImageSet,
        pending: &mut PendingQueue,
    ) -> PassStats {
        let mut stats = PassStats::default();
        let mut handled: HashSet<ImageId> = HashSet::new();

        loop {
            let batch = self
                .build_batch(candidates, filter, processed, pending, &mut handled, &mut stats)
                .await;
            if batch.is_empty() {
                break;
            }
            stats.batch_sizes.push(batch.len());
            self.complete_batch(batch, candidates, processed, &mut stats).await;
        }

        stats
    }

    async fn build_batch(
        &self,
        candidates: &[ImageDescriptor],
        filter: &RepoFilter,
        processed: &ImageSet,
        pending: &mut PendingQueue,
        handled: &mut HashSet<ImageId>,
        stats: &mut PassStats,
    ) -> Vec<ImageDescriptor> {
        let mut batch = Vec::with_capacity(self.batch_size);

        for descriptor in candidates {
            if batch.len() == self.batch_size {
                break;
            }
            if !filter.allows(&descriptor.repo) {
                debug!(repo = %descriptor.repo, image = %descriptor.image, "Repo filtered out");
                continue;
            }
            if handled.contains(&descriptor.image) {
                continue;
            }
            if processed.contains(&descriptor.image) {
                debug!(image = %descriptor.image, "Already processed");
                continue;
            }
            handled.insert(descriptor.image.clone());

            if let Err(e) = self.runtime.pull(descriptor).await {
                warn!(
                    repo = %descriptor.repo,
                    image = %descriptor.image,
                    reference = %descriptor.reference,
                    error = %e,
                    "Pull failed, deferring image"
                );
                stats.deferred.push(descriptor.clone());
                continue;
            }
            stats.pulled += 1;
            // A retried image may still be on disk from its failed attempt
            if !pending.contains(&descriptor.image) {
                pending.push(descriptor.clone());
                self.evict(pending, stats).await;
            }

            batch.push(descriptor.clone());
        }

        batch
    }

    async fn evict(&self, pending: &mut PendingQueue, stats: &mut PassStats) {
        let evicted = pending.evict_over(self.retention_threshold);
        if evicted.is_empty() {
            return;
        }
        stats.evicted += evicted.len();
        debug!(images = evicted.len(), "Removing oldest pulled images");
        if let Err(e) = self.runtime.remove(&evicted).await {
            warn!(
                images = ?evicted.iter().map(|d| d.image.as_str()).collect::<Vec<_>>(),
                error = %e,
                "Failed to remove pulled images"
            );
        }
    }

    async fn complete_batch(
        &self,
        batch: Vec<ImageDescriptor>,
        candidates: &[ImageDescriptor],
        processed: &mut ImageSet,
        stats: &mut PassStats,
    ) {
        let mut results = match self.dispatcher.dispatch(&batch).await {
            Ok(results) => results,
            Err(e) => {
                error!(
                    images = ?batch.iter().map(|d| d.image.as_str()).collect::<Vec<_>>(),
                    error = %e,
                    "Extraction failed, deferring batch"
                );
                stats.deferred.extend(batch);
                return;
            }
        };

        // Other tags of the same image were skipped as duplicates
        for report in results.values_mut() {
            for retag in candidates
                .iter()
                .filter(|d| d.image == report.image && d.repo == report.repo)
            {
                if !report.tags.contains(&retag.tag) {
                    report.tags.push(retag.tag.clone());
                }
            }
        }

        let delivery = self.sinks.deliver(&results).await;

        let images: Vec<ImageId> = batch.iter().map(|d| d.image.clone()).collect();
        processed.extend(images.iter().cloned());
        stats.processed += images.len();

        if let Err(e) = self.ledger.append(&images).await {
            error!(
                images = ?images.iter().map(ImageId::as_str).collect::<Vec<_>>(),
                error = %e,
                "Failed to persist list of collected images"
            );
        }

        info!(
            images = images.len(),
            sinks_failed = delivery.failed.len(),
            "Batch collected"
        );
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::sinks::FileSink;
    use crate::harvest::test_support::{CallLog, MockExtractor, MockRuntime, RecordingSink};
    use crate::model::{descriptor, ImageReport, RepoId};
    use crate::traits::Sink;

    struct Fixture {
        log: CallLog,
        controller: BatchController,
        ledger_path: std::path::PathBuf,
        _dir: tempfile::TempDir,
    }

    fn fixture_with(runtime: MockRuntime, extractor: MockExtractor, log: CallLog) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let ledger_path = dir.path().join("imagelist");
        let sinks: Vec<Arc<dyn Sink>> = vec![
            Arc::new(RecordingSink::new("file", log.clone())),
            Arc::new(RecordingSink::new("remote", log.clone())),
        ];
        let controller = BatchController::new(
            Arc::new(runtime),
            ExtractionDispatcher::new(Arc::new(extractor)),
            SinkFanOut::new(sinks),
            Ledger::new(&ledger_path),
        )
        .with_batch_size(5)
        .with_retention_threshold(10);

        Fixture {
            log,
            controller,
            ledger_path,
            _dir: dir,
        }
    }

    fn fixture() -> Fixture {
        let log = CallLog::default();
        fixture_with(
            MockRuntime::new(log.clone()),
            MockExtractor::new(log.clone()),
            log,
        )
    }

    fn app_images(n: usize) -> Vec<ImageDescriptor> {
        (0..n)
            .map(|i| descriptor("acme/app", &format!("v{i}"), &format!("sha:{i:02}")))
            .collect()
    }

    #[tokio::test]
    async fn test_scenario_batches_eviction_and_filtering() {
        let f = fixture();
        let mut candidates = app_images(11);
        candidates.insert(4, descriptor("acme/other", "latest", "sha:other"));
        let filter = RepoFilter::new([RepoId::from("acme/app")]);
        let mut processed = ImageSet::new();
        let mut pending = PendingQueue::new();

        let stats = f
            .controller
            .run_batch_pass(&candidates, &filter, &mut processed, &mut pending)
            .await;

        assert_eq!(stats.batch_sizes, vec![5, 5, 1]);
        assert_eq!(stats.pulled, 11);
        assert_eq!(stats.processed, 11);
        assert_eq!(stats.evicted, 10);
        assert_eq!(pending.len(), 1);
        assert_eq!(processed.len(), 11);

        // Eviction of the oldest ten happens right after the eleventh pull
        let calls = f.log.calls();
        let eleventh = calls.iter().position(|c| c == "pull acme/app sha:10").unwrap();
        let expected_removal = format!(
            "remove {}",
            (0..10).map(|i| format!("sha:{i:02}")).collect::<Vec<_>>().join(",")
        );
        assert_eq!(calls[eleventh + 1], expected_removal);

        assert!(calls.iter().all(|c| !c.contains("acme/other") && !c.contains("sha:other")));

        let ledger = Ledger::new(&f.ledger_path).load().await.unwrap();
        assert_eq!(ledger.len(), 11);
    }

    #[tokio::test]
    async fn test_pending_never_exceeds_threshold_between_steps() {
        let f = fixture();
        let mut pending = PendingQueue::new();
        let mut processed = ImageSet::new();

        f.controller
            .run_batch_pass(&app_images(37), &RepoFilter::allow_all(), &mut processed, &mut pending)
            .await;

        assert!(pending.len() <= 10);
        for removal in f.log.with_prefix("remove ") {
            assert_eq!(removal.split(',').count(), 10);
        }
    }

    #[tokio::test]
    async fn test_processed_images_are_never_pulled() {
        let f = fixture();
        let candidates = vec![
            descriptor("acme/app", "a", "sha:aaa"),
            descriptor("acme/app", "b", "sha:bbb"),
            descriptor("acme/app", "c", "sha:ccc"),
        ];
        let mut processed: ImageSet = [ImageId::from("sha:aaa"), ImageId::from("sha:bbb")]
            .into_iter()
            .collect();

        let stats = f
            .controller
            .run_batch_pass(
                &candidates,
                &RepoFilter::allow_all(),
                &mut processed,
                &mut PendingQueue::new(),
            )
            .await;

        assert_eq!(stats.pulled, 1);
        assert_eq!(f.log.with_prefix("pull "), vec!["pull acme/app sha:ccc".to_string()]);
        assert_eq!(f.log.with_prefix("extract "), vec!["extract sha:ccc".to_string()]);
    }

    #[tokio::test]
    async fn test_retagged_identity_is_pulled_once() {
        let f = fixture();
        let candidates = vec![
            descriptor("acme/app", "latest", "sha:aaa"),
            descriptor("acme/app", "1.0", "sha:aaa"),
        ];

        let stats = f
            .controller
            .run_batch_pass(
                &candidates,
                &RepoFilter::allow_all(),
                &mut ImageSet::new(),
                &mut PendingQueue::new(),
            )
            .await;

        assert_eq!(stats.pulled, 1);
        assert_eq!(stats.batch_sizes, vec![1]);
    }

    #[tokio::test]
    async fn test_report_carries_every_tag_of_the_image() {
        let log = CallLog::default();
        let dir = tempfile::tempdir().unwrap();
        let out_dir = dir.path().join("out");
        let controller = BatchController::new(
            Arc::new(MockRuntime::new(log.clone())),
            ExtractionDispatcher::new(Arc::new(MockExtractor::new(log.clone()))),
            SinkFanOut::new(vec![Arc::new(FileSink::new(&out_dir)) as Arc<dyn Sink>]),
            Ledger::new(dir.path().join("imagelist")),
        );
        let candidates = vec![
            descriptor("acme/app", "latest", "sha:aaa"),
            descriptor("acme/app", "1.0", "sha:aaa"),
            descriptor("acme/mirror", "latest", "sha:aaa"),
        ];

        controller
            .run_batch_pass(
                &candidates,
                &RepoFilter::allow_all(),
                &mut ImageSet::new(),
                &mut PendingQueue::new(),
            )
            .await;

        let body = std::fs::read_to_string(out_dir.join("images").join("sha_aaa.json")).unwrap();
        let report: ImageReport = serde_json::from_str(&body).unwrap();
        assert_eq!(report.tags, vec!["latest".to_string(), "1.0".to_string()]);
    }

    #[tokio::test]
    async fn test_denied_repo_never_batched() {
        let f = fixture();
        let filter = RepoFilter::new([RepoId::from("acme/app"), RepoId::from("acme/secret")])
            .with_denied([RepoId::from("acme/secret")]);
        let candidates = vec![
            descriptor("acme/secret", "1", "sha:secret"),
            descriptor("acme/app", "1", "sha:app"),
        ];

        f.controller
            .run_batch_pass(&candidates, &filter, &mut ImageSet::new(), &mut PendingQueue::new())
            .await;

        assert!(f.log.calls().iter().all(|c| !c.contains("sha:secret")));
        assert_eq!(f.log.with_prefix("extract "), vec!["extract sha:app".to_string()]);
    }

    #[tokio::test]
    async fn test_extraction_failure_marks_nothing() {
        let log = CallLog::default();
        let f = fixture_with(
            MockRuntime::new(log.clone()),
            MockExtractor::new(log.clone()).failing(1),
            log,
        );
        let mut processed = ImageSet::new();

        let stats = f
            .controller
            .run_batch_pass(
                &app_images(7),
                &RepoFilter::allow_all(),
                &mut processed,
                &mut PendingQueue::new(),
            )
            .await;

        // First batch of five fails, the remaining two succeed
        assert_eq!(stats.batch_sizes, vec![5, 2]);
        assert_eq!(stats.deferred.len(), 5);
        assert_eq!(processed.len(), 2);
        assert!(f.log.with_prefix("deliver ").iter().all(|c| !c.contains("sha:00")));

        let ledger = Ledger::new(&f.ledger_path).load().await.unwrap();
        assert_eq!(ledger.len(), 2);
        assert!(!ledger.contains(&ImageId::from("sha:00")));
    }

    #[tokio::test]
    async fn test_retried_image_is_queued_once() {
        let log = CallLog::default();
        let f = fixture_with(
            MockRuntime::new(log.clone()),
            MockExtractor::new(log.clone()).failing(1),
            log,
        );
        let mut processed = ImageSet::new();
        let mut pending = PendingQueue::new();

        let first = f
            .controller
            .run_batch_pass(&app_images(3), &RepoFilter::allow_all(), &mut processed, &mut pending)
            .await;
        assert_eq!(first.deferred.len(), 3);
        assert_eq!(pending.len(), 3);

        let second = f
            .controller
            .run_batch_pass(&first.deferred, &RepoFilter::allow_all(), &mut processed, &mut pending)
            .await;

        assert_eq!(second.processed, 3);
        assert_eq!(pending.len(), 3);
        assert_eq!(pending.iter().filter(|d| d.image == ImageId::from("sha:00")).count(), 1);
    }

    #[tokio::test]
    async fn test_ledger_failure_keeps_batch_processed_in_memory() {
        let log = CallLog::default();
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened for appending
        let controller = BatchController::new(
            Arc::new(MockRuntime::new(log.clone())),
            ExtractionDispatcher::new(Arc::new(MockExtractor::new(log.clone()))),
            SinkFanOut::new(vec![
                Arc::new(RecordingSink::new("file", log.clone())) as Arc<dyn Sink>
            ]),
            Ledger::new(dir.path()),
        );
        let mut processed = ImageSet::new();

        let stats = controller
            .run_batch_pass(
                &app_images(7),
                &RepoFilter::allow_all(),
                &mut processed,
                &mut PendingQueue::new(),
            )
            .await;

        assert_eq!(stats.batch_sizes, vec![5, 2]);
        assert_eq!(stats.processed, 7);
        assert!(stats.deferred.is_empty());
        assert_eq!(processed.len(), 7);
        assert_eq!(log.with_prefix("deliver ").len(), 2);
    }

    #[tokio::test]
    async fn test_pull_failure_defers_image() {
        let log = CallLog::default();
        let f = fixture_with(
            MockRuntime::new(log.clone()).failing_pull("sha:01"),
            MockExtractor::new(log.clone()),
            log,
        );
        let mut processed = ImageSet::new();

        let stats = f
            .controller
            .run_batch_pass(
                &app_images(3),
                &RepoFilter::allow_all(),
                &mut processed,
                &mut PendingQueue::new(),
            )
            .await;

        assert_eq!(stats.pulled, 2);
        assert_eq!(stats.deferred.len(), 1);
        assert_eq!(stats.deferred[0].image, ImageId::from("sha:01"));
        assert!(!processed.contains(&ImageId::from("sha:01")));
        assert_eq!(f.log.with_prefix("extract "), vec!["extract sha:00,sha:02".to_string()]);
    }

    #[tokio::test]
    async fn test_sink_failure_still_marks_processed() {
        let log = CallLog::default();
        let dir = tempfile::tempdir().unwrap();
        let ledger_path = dir.path().join("imagelist");
        let sinks: Vec<Arc<dyn Sink>> = vec![
            Arc::new(RecordingSink::failing("file", log.clone())),
            Arc::new(RecordingSink::new("remote", log.clone())),
        ];
        let controller = BatchController::new(
            Arc::new(MockRuntime::new(log.clone())),
            ExtractionDispatcher::new(Arc::new(MockExtractor::new(log.clone()))),
            SinkFanOut::new(sinks),
            Ledger::new(&ledger_path),
        );
        let mut processed = ImageSet::new();

        controller
            .run_batch_pass(
                &app_images(2),
                &RepoFilter::allow_all(),
                &mut processed,
                &mut PendingQueue::new(),
            )
            .await;

        assert_eq!(
            log.with_prefix("deliver "),
            vec![
                "deliver file sha:00,sha:01".to_string(),
                "deliver remote sha:00,sha:01".to_string()
            ]
        );
        assert_eq!(processed.len(), 2);
        assert_eq!(Ledger::new(&ledger_path).load().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_ledger_append_happens_after_every_sink() {
        let f = fixture();
        f.controller
            .run_batch_pass(
                &app_images(6),
                &RepoFilter::allow_all(),
                &mut ImageSet::new(),
                &mut PendingQueue::new(),
            )
            .await;

        // Batch two is pulled only after batch one was delivered to both sinks
        let calls = f.log.calls();
        let second_sink = calls.iter().position(|c| c.starts_with("deliver remote")).unwrap();
        let sixth_pull = calls.iter().position(|c| c == "pull acme/app sha:05").unwrap();
        assert!(second_sink < sixth_pull);
    }

    #[tokio::test]
    async fn test_eviction_failure_is_not_fatal() {
        let log = CallLog::default();
        let f = fixture_with(
            MockRuntime::new(log.clone()).failing_removals(),
            MockExtractor::new(log.clone()),
            log,
        );
        let mut pending = PendingQueue::new();

        let stats = f
            .controller
            .run_batch_pass(
                &app_images(12),
                &RepoFilter::allow_all(),
                &mut ImageSet::new(),
                &mut pending,
            )
            .await;

        assert_eq!(stats.processed, 12);
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_candidates_do_nothing() {
        let f = fixture();
        let stats = f
            .controller
            .run_batch_pass(
                &[],
                &RepoFilter::allow_all(),
                &mut ImageSet::new(),
                &mut PendingQueue::new(),
            )
            .await;

        assert_eq!(stats.batches(), 0);
        assert!(f.log.calls().is_empty());
    }
}
