//! Core data model: image and repository identities, discovered
//! descriptors, the change set and the per-image extraction report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Content-derived identifier of a single image (a manifest digest).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(String);

impl ImageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ImageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Registry-qualified repository name, the unit of filtering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoId(String);

impl RepoId {
    pub fn new(repo: impl Into<String>) -> Self {
        Self(repo.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RepoId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One discovered unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    pub image: ImageId,
    pub repo: RepoId,
    pub tag: String,

    /// Reference handed to the runtime to pull, run and remove the image
    /// (e.g. `registry.example.com/acme/app@sha256:...`).
    pub reference: String,

    pub discovered_at: DateTime<Utc>,
}

impl ImageDescriptor {
    /// Key used by the [`DiscoverySet`]: one entry per `repo:tag`.
    pub fn discovery_key(&self) -> String {
        format!("{}:{}", self.repo, self.tag)
    }
}

/// Identities that completed a full batch.
pub type ImageSet = HashSet<ImageId>;

/// Every descriptor seen by this process, keyed by `repo:tag`.
///
/// The set only grows: a key whose identity changes is overwritten in
/// place, never removed.
#[derive(Debug, Clone, Default)]
pub struct DiscoverySet {
    entries: BTreeMap<String, ImageDescriptor>,
}

impl DiscoverySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&ImageDescriptor> {
        self.entries.get(key)
    }

    /// Folds freshly listed descriptors into a copy of this snapshot.
    ///
    /// Returns the updated snapshot and the descriptors that are new
    /// relative to `self`: keys never seen before, or keys now pointing at
    /// a different image.
    pub fn merge(
        &self,
        listed: impl IntoIterator<Item = ImageDescriptor>,
    ) -> (DiscoverySet, Vec<ImageDescriptor>) {
        let mut updated = self.clone();
        let mut fresh = Vec::new();

        for descriptor in listed {
            let key = descriptor.discovery_key();
            let changed = match updated.entries.get(&key) {
                Some(known) => known.image != descriptor.image,
                None => true,
            };
            if changed {
                updated.entries.insert(key, descriptor.clone());
                fresh.push(descriptor);
            }
        }

        (updated, fresh)
    }
}

/// Output of one inspection script run inside an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptOutput {
    /// `None` when the script could not be started or was killed
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ScriptOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Everything extracted from one image.
///
/// The collection loop treats this as opaque and only hands it to sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageReport {
    pub image: ImageId,
    pub repo: RepoId,
    pub tags: Vec<String>,
    pub extracted_at: DateTime<Utc>,

    /// Version of the collector that produced this report
    pub collector_version: String,

    /// Script name -> output
    pub outputs: BTreeMap<String, ScriptOutput>,
}

impl ImageReport {
    pub fn new(descriptor: &ImageDescriptor) -> Self {
        Self {
            image: descriptor.image.clone(),
            repo: descriptor.repo.clone(),
            tags: vec![descriptor.tag.clone()],
            extracted_at: Utc::now(),
            collector_version: env!("CARGO_PKG_VERSION").to_string(),
            outputs: BTreeMap::new(),
        }
    }
}

/// Per-image results of one extraction call.
pub type ExtractionResults = BTreeMap<ImageId, ImageReport>;

#[cfg(test)]
pub(crate) fn descriptor(repo: &str, tag: &str, image: &str) -> ImageDescriptor {
    ImageDescriptor {
        image: ImageId::from(image),
        repo: RepoId::from(repo),
        tag: tag.to_string(),
        reference: format!("{}@{}", repo, image),
        discovered_at: Utc::now(),
    }
}
