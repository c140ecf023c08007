use serde::{Deserialize, Serialize};

use crate::error::{FaceClusterError, Result};

/// Lowest similarity threshold the engine accepts.
pub const MIN_THRESHOLD: f32 = 0.4;

/// Highest similarity threshold the engine accepts.
pub const MAX_THRESHOLD: f32 = 0.8;

/// Threshold used when [`Config::threshold`] is left at zero.
pub const DEFAULT_THRESHOLD: f32 = 0.6;

/// Confidence above which a face replaces its cluster's thumbnail.
pub const DEFAULT_THUMBNAIL_CONFIDENCE: f32 = 0.95;

/// How encodings of an unexpected length are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimensionPolicy {
    /// Compare over the shared prefix and log a warning.
    #[default]
    Truncate,

    /// Refuse the encoding with [`FaceClusterError::DimensionMismatch`].
    Reject,
}

/// Controls clustering behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Minimum cosine similarity to attach a face to an existing cluster.
    /// Clamped into `[0.4, 0.8]`. Default: 0.6.
    pub threshold: f32,

    /// Expected embedding dimension. 0 means the first stored encoding
    /// defines it.
    pub dim: usize,

    /// What to do with encodings whose length differs from the expected
    /// dimension.
    pub dimension_policy: DimensionPolicy,

    /// A face with confidence strictly above this becomes the cluster
    /// thumbnail. Default: 0.95.
    pub thumbnail_confidence: f32,

    /// Carry names and types of the previous clusters over to the clusters
    /// rebuilt by a full recluster.
    pub carry_labels: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            dim: 0,
            dimension_policy: DimensionPolicy::Truncate,
            thumbnail_confidence: DEFAULT_THUMBNAIL_CONFIDENCE,
            carry_labels: true,
        }
    }
}

impl Config {
    pub(crate) fn with_defaults(mut self) -> Self {
        if self.threshold == 0.0 {
            self.threshold = DEFAULT_THRESHOLD;
        }
        if self.thumbnail_confidence == 0.0 {
            self.thumbnail_confidence = DEFAULT_THUMBNAIL_CONFIDENCE;
        }
        self.threshold = clamp_threshold(self.threshold);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.threshold.is_finite() {
            return Err(FaceClusterError::InvalidConfig(format!(
                "threshold must be finite, got {}",
                self.threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.thumbnail_confidence) {
            return Err(FaceClusterError::InvalidConfig(format!(
                "thumbnail_confidence must be within [0, 1], got {}",
                self.thumbnail_confidence
            )));
        }
        Ok(())
    }
}

/// Clamps a requested threshold into `[MIN_THRESHOLD, MAX_THRESHOLD]`.
/// NaN passes through unchanged; callers must reject it.
pub fn clamp_threshold(t: f32) -> f32 {
    t.clamp(MIN_THRESHOLD, MAX_THRESHOLD)
}
