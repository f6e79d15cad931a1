use std::collections::VecDeque;

use crate::model::{ImageDescriptor, ImageId};

/// Pulled images that are still on local disk, oldest first.
#[derive(Debug, Clone, Default)]
pub struct PendingQueue {
    pulled: VecDeque<ImageDescriptor>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pulled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pulled.is_empty()
    }

    pub fn contains(&self, image: &ImageId) -> bool {
        self.pulled.iter().any(|d| &d.image == image)
    }

    pub fn push(&mut self, image: ImageDescriptor) {
        self.pulled.push_back(image);
    }

    /// Pops the oldest `threshold` images once the queue has grown past
    /// `threshold`. Returns nothing while within bounds or when the
    /// threshold is zero (eviction disabled).
    pub fn evict_over(&mut self, threshold: usize) -> Vec<ImageDescriptor> {
        if threshold == 0 || self.pulled.len() <= threshold {
            return Vec::new();
        }
        self.pulled.drain(..threshold).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ImageDescriptor> {
        self.pulled.iter()
    }
}
