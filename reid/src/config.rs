use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Controls tracking and resolution behavior.
///
/// Every field has a default, so a partial YAML section deserializes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReidConfig {
    /// Minimum IoU (exclusive) for a detection to continue a track.
    /// Default: 0.3.
    pub iou_threshold: f32,

    /// Frames without a match before a track is evicted.
    /// Default: 5.
    pub max_age: u32,

    /// Minimum cosine similarity (exclusive) to accept a stored identity.
    /// Lower = more merges, higher = more new identities.
    /// Default: 0.4.
    pub similarity_threshold: f32,

    /// Threshold for operator duplicate scans.
    /// Default: `similarity_threshold + 0.1`.
    pub duplicate_threshold: Option<f32>,

    /// Nearest neighbors requested per store query. Default: 1.
    pub query_k: usize,

    /// Resolution queue capacity. Default: 8.
    pub queue_capacity: usize,

    /// Resolution worker count. Default: 2.
    pub workers: usize,

    /// Upper bound on a single resolution attempt, in milliseconds.
    /// Default: 5000.
    pub resolve_timeout_ms: u64,

    /// Where representative crops are written as `reid_<n>.jpg`.
    /// No snapshots are taken when unset.
    pub image_dir: Option<PathBuf>,
}

impl Default for ReidConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.3,
            max_age: 5,
            similarity_threshold: 0.4,
            duplicate_threshold: None,
            query_k: 1,
            queue_capacity: 8,
            workers: 2,
            resolve_timeout_ms: 5000,
            image_dir: None,
        }
    }
}

impl ReidConfig {
    /// Replaces zero or out-of-range values with defaults.
    pub fn with_defaults(mut self) -> Self {
        let d = Self::default();
        if !(self.iou_threshold > 0.0 && self.iou_threshold < 1.0) {
            self.iou_threshold = d.iou_threshold;
        }
        if self.max_age == 0 {
            self.max_age = d.max_age;
        }
        if !(self.similarity_threshold > -1.0 && self.similarity_threshold < 1.0) {
            self.similarity_threshold = d.similarity_threshold;
        }
        if self.query_k == 0 {
            self.query_k = d.query_k;
        }
        if self.queue_capacity == 0 {
            self.queue_capacity = d.queue_capacity;
        }
        if self.workers == 0 {
            self.workers = d.workers;
        }
        if self.resolve_timeout_ms == 0 {
            self.resolve_timeout_ms = d.resolve_timeout_ms;
        }
        self
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    /// Threshold used by duplicate scans when the caller gives none.
    pub fn duplicate_threshold(&self) -> f32 {
        self.duplicate_threshold
            .unwrap_or(self.similarity_threshold + 0.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ReidConfig::default();
        assert_eq!(cfg.iou_threshold, 0.3);
        assert_eq!(cfg.max_age, 5);
        assert_eq!(cfg.similarity_threshold, 0.4);
        assert!((cfg.duplicate_threshold() - 0.5).abs() < 1e-6);
        assert_eq!(cfg.resolve_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn with_defaults_fills_zeros() {
        let cfg = ReidConfig {
            iou_threshold: 0.0,
            max_age: 0,
            similarity_threshold: 1.5,
            query_k: 0,
            queue_capacity: 0,
            workers: 0,
            resolve_timeout_ms: 0,
            ..Default::default()
        }
        .with_defaults();
        assert_eq!(cfg.iou_threshold, 0.3);
        assert_eq!(cfg.max_age, 5);
        assert_eq!(cfg.similarity_threshold, 0.4);
        assert_eq!(cfg.query_k, 1);
        assert_eq!(cfg.queue_capacity, 8);
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.resolve_timeout_ms, 5000);
    }

    #[test]
    fn explicit_duplicate_threshold() {
        let cfg = ReidConfig {
            duplicate_threshold: Some(0.8),
            ..Default::default()
        };
        assert_eq!(cfg.duplicate_threshold(), 0.8);
    }
}
