//! Identity clustering for face and pet embeddings.
//!
//! Faces detected by an external analysis service are grouped into
//! persistent clusters, one per person or pet, without knowing the number
//! of identities in advance. Each new face joins the cluster whose
//! representative encoding (the mean of its members) is most cosine-similar,
//! or starts a new cluster when no similarity reaches the threshold.
//!
//! # Usage
//!
//! ```
//! use giztoy_facecluster::{Config, FaceInput, Manager};
//!
//! let mgr = Manager::new(Config::default()).unwrap();
//!
//! let face = |encoding: Vec<f32>| FaceInput { encoding, location: None, confidence: 0.9 };
//! let a = mgr.process_faces("img-1", &[face(vec![1.0, 0.0, 0.0])]).unwrap();
//! let b = mgr.process_faces("img-2", &[face(vec![0.98, 0.05, 0.0])]).unwrap();
//! assert_eq!(a[0].cluster_id, b[0].cluster_id);
//!
//! let summary = &mgr.clusters()[0];
//! assert_eq!(summary.photo_count, 2);
//! ```
//!
//! # Design
//!
//! [`Manager`] serializes every mutation under one registry-wide lock, so
//! the "find best match, else create" decision can never race with another
//! worker. Mutations are journaled by an internal registry and written to a
//! [`ClusterStore`] as one atomic [`Batch`]; a failed write rolls the
//! registry back. [`Manager::recluster_all`] rebuilds everything in face id
//! order, so the same faces and threshold always yield the same partition.
//!
//! The registry itself is not exported; every mutation goes through the
//! manager:
//!
//! ```compile_fail
//! use giztoy_facecluster::Registry;
//! ```

pub mod centroid;
mod config;
mod error;
mod manager;
pub mod matcher;
mod redb;
mod registry;
mod store;
mod types;
pub mod vector;

pub use crate::redb::RedbStore;
pub use config::{
    Config, DEFAULT_THRESHOLD, DEFAULT_THUMBNAIL_CONFIDENCE, DimensionPolicy, MAX_THRESHOLD,
    MIN_THRESHOLD, clamp_threshold,
};
pub use error::{FaceClusterError, Result};
pub use manager::Manager;
pub use store::{Batch, ClusterStore, MemoryStore, Snapshot};
pub use types::{
    Cluster, ClusterId, ClusterKind, ClusterSummary, Face, FaceAssignment, FaceId, FaceInput,
};
pub use vector::{cosine_similarity, euclidean_distance};
