use thiserror::Error;

use crate::types::{ClusterId, FaceId};

/// Errors returned by facecluster operations.
#[derive(Debug, Error)]
pub enum FaceClusterError {
    #[error("facecluster: store error: {0}")]
    Store(String),

    #[error("facecluster: serialization error: {0}")]
    Serialization(String),

    #[error("facecluster: cluster not found: {0}")]
    ClusterNotFound(ClusterId),

    #[error("facecluster: face not found: {0}")]
    FaceNotFound(FaceId),

    #[error("facecluster: cannot merge {0} into itself")]
    SameCluster(ClusterId),

    #[error("facecluster: dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("facecluster: invalid cluster type: {0:?}")]
    InvalidKind(String),

    #[error("facecluster: invalid config: {0}")]
    InvalidConfig(String),
}

/// Result type for facecluster operations.
pub type Result<T> = std::result::Result<T, FaceClusterError>;
