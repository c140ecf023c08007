use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::{FaceClusterError, Result};
use crate::types::{Cluster, ClusterId, Face, FaceId};

/// Everything a store holds.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub faces: Vec<Face>,
    pub clusters: Vec<Cluster>,
}

/// A set of changes that must land together.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub put_faces: Vec<Face>,
    pub delete_faces: Vec<FaceId>,
    pub put_clusters: Vec<Cluster>,
    pub delete_clusters: Vec<ClusterId>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.put_faces.is_empty()
            && self.delete_faces.is_empty()
            && self.put_clusters.is_empty()
            && self.delete_clusters.is_empty()
    }

    /// Number of records touched.
    pub fn len(&self) -> usize {
        self.put_faces.len()
            + self.delete_faces.len()
            + self.put_clusters.len()
            + self.delete_clusters.len()
    }
}

/// Persists faces and clusters behind the registry.
///
/// Implementations must be safe for concurrent use, and [`apply`](Self::apply)
/// must be atomic: either every change in the batch is stored or none is.
/// Use [`MemoryStore`] for in-memory storage (testing/ephemeral) and
/// [`RedbStore`](crate::RedbStore) for a durable file.
pub trait ClusterStore: Send + Sync {
    /// Returns every stored face and cluster, ordered by id.
    fn load(&self) -> Result<Snapshot>;

    /// Applies a batch atomically.
    fn apply(&self, batch: &Batch) -> Result<()>;
}

/// In-memory [`ClusterStore`] implementation.
/// Data is lost on restart. Suitable for testing or ephemeral use.
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    faces: BTreeMap<FaceId, Face>,
    clusters: BTreeMap<ClusterId, Cluster>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryStoreInner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterStore for MemoryStore {
    fn load(&self) -> Result<Snapshot> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| FaceClusterError::Store(e.to_string()))?;
        Ok(Snapshot {
            faces: inner.faces.values().cloned().collect(),
            clusters: inner.clusters.values().cloned().collect(),
        })
    }

    fn apply(&self, batch: &Batch) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| FaceClusterError::Store(e.to_string()))?;
        for id in &batch.delete_faces {
            inner.faces.remove(id);
        }
        for id in &batch.delete_clusters {
            inner.clusters.remove(id);
        }
        for face in &batch.put_faces {
            inner.faces.insert(face.id, face.clone());
        }
        for cluster in &batch.put_clusters {
            inner.clusters.insert(cluster.id, cluster.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClusterKind;

    fn face(id: u64) -> Face {
        Face {
            id: FaceId(id),
            image_id: format!("img{id}"),
            index: 0,
            encoding: vec![1.0, 0.0],
            location: None,
            confidence: 0.5,
            cluster_id: Some(ClusterId(1)),
        }
    }

    fn cluster(id: u64) -> Cluster {
        Cluster {
            id: ClusterId(id),
            name: None,
            kind: ClusterKind::Person,
            representative_encoding: vec![1.0, 0.0],
            thumbnail: Some("img1".into()),
            photo_count: 1,
        }
    }

    #[test]
    fn memory_store_apply_and_load() {
        let store = MemoryStore::new();
        store
            .apply(&Batch {
                put_faces: vec![face(2), face(1)],
                put_clusters: vec![cluster(1)],
                ..Batch::default()
            })
            .unwrap();

        let snap = store.load().unwrap();
        assert_eq!(snap.faces.len(), 2);
        assert_eq!(snap.faces[0].id, FaceId(1), "faces should be ordered by id");
        assert_eq!(snap.clusters.len(), 1);
    }

    #[test]
    fn memory_store_deletes() {
        let store = MemoryStore::new();
        store
            .apply(&Batch {
                put_faces: vec![face(1), face(2)],
                put_clusters: vec![cluster(1), cluster(2)],
                ..Batch::default()
            })
            .unwrap();
        store
            .apply(&Batch {
                delete_faces: vec![FaceId(1)],
                delete_clusters: vec![ClusterId(2)],
                ..Batch::default()
            })
            .unwrap();

        let snap = store.load().unwrap();
        assert_eq!(snap.faces.len(), 1);
        assert_eq!(snap.faces[0].id, FaceId(2));
        assert_eq!(snap.clusters.len(), 1);
        assert_eq!(snap.clusters[0].id, ClusterId(1));
    }

    #[test]
    fn batch_len_and_empty() {
        let mut batch = Batch::default();
        assert!(batch.is_empty());
        batch.delete_clusters.push(ClusterId(3));
        batch.put_faces.push(face(1));
        assert!(!batch.is_empty());
        assert_eq!(batch.len(), 2);
    }
}
