//! Redb-backed durable [`ClusterStore`].

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;

use crate::error::{FaceClusterError, Result};
use crate::store::{Batch, ClusterStore, Snapshot};
use crate::types::{ClusterId, FaceId};

const TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("facecluster");

const FACE_PREFIX: &str = "face:";
const CLUSTER_PREFIX: &str = "cluster:";

/// Key layout:
///
/// ```text
/// face:{id_20d}    -> JSON-encoded Face
/// cluster:{id_20d} -> JSON-encoded Cluster
/// ```
///
/// Ids are zero-padded so key order matches id order.
fn face_key(id: FaceId) -> String {
    format!("{FACE_PREFIX}{:020}", id.0)
}

fn cluster_key(id: ClusterId) -> String {
    format!("{CLUSTER_PREFIX}{:020}", id.0)
}

fn storage_err(e: impl std::fmt::Display) -> FaceClusterError {
    FaceClusterError::Store(e.to_string())
}

fn decode<T: DeserializeOwned>(key: &str, data: &[u8]) -> Result<T> {
    serde_json::from_slice(data)
        .map_err(|e| FaceClusterError::Serialization(format!("{key}: {e}")))
}

/// A persistent cluster store backed by redb.
/// Each [`Batch`] is applied in a single write transaction.
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create a redb store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = Database::create(path).map_err(storage_err)?;

        // Create the table if it doesn't exist
        let tx = db.begin_write().map_err(storage_err)?;
        {
            let _ = tx.open_table(TABLE).map_err(storage_err)?;
        }
        tx.commit().map_err(storage_err)?;

        Ok(Self { db })
    }
}

impl ClusterStore for RedbStore {
    fn load(&self) -> Result<Snapshot> {
        let tx = self.db.begin_read().map_err(storage_err)?;
        let table = tx.open_table(TABLE).map_err(storage_err)?;

        let mut snap = Snapshot::default();
        for item in table.iter().map_err(storage_err)? {
            let (key, value) = item.map_err(storage_err)?;
            let key = key.value();
            if key.starts_with(FACE_PREFIX) {
                snap.faces.push(decode(key, value.value())?);
            } else if key.starts_with(CLUSTER_PREFIX) {
                snap.clusters.push(decode(key, value.value())?);
            }
        }
        Ok(snap)
    }

    fn apply(&self, batch: &Batch) -> Result<()> {
        let tx = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = tx.open_table(TABLE).map_err(storage_err)?;
            for id in &batch.delete_faces {
                table.remove(face_key(*id).as_str()).map_err(storage_err)?;
            }
            for id in &batch.delete_clusters {
                table.remove(cluster_key(*id).as_str()).map_err(storage_err)?;
            }
            for face in &batch.put_faces {
                let data = serde_json::to_vec(face)
                    .map_err(|e| FaceClusterError::Serialization(e.to_string()))?;
                table
                    .insert(face_key(face.id).as_str(), data.as_slice())
                    .map_err(storage_err)?;
            }
            for cluster in &batch.put_clusters {
                let data = serde_json::to_vec(cluster)
                    .map_err(|e| FaceClusterError::Serialization(e.to_string()))?;
                table
                    .insert(cluster_key(cluster.id).as_str(), data.as_slice())
                    .map_err(storage_err)?;
            }
        }
        // Dropping an uncommitted transaction aborts it, so an error above
        // leaves the database untouched.
        tx.commit().map_err(storage_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Cluster, ClusterKind, Face};
    use tempfile::tempdir;

    fn face(id: u64, cluster: Option<u64>) -> Face {
        Face {
            id: FaceId(id),
            image_id: format!("img{id}"),
            index: 0,
            encoding: vec![0.25, -0.5, 1.0],
            location: Some(serde_json::json!({"x": 1, "y": 2, "w": 30, "h": 40})),
            confidence: 0.97,
            cluster_id: cluster.map(ClusterId),
        }
    }

    fn cluster(id: u64) -> Cluster {
        Cluster {
            id: ClusterId(id),
            name: Some("Alice".into()),
            kind: ClusterKind::Person,
            representative_encoding: vec![0.25, -0.5, 1.0],
            thumbnail: Some("img1".into()),
            photo_count: 1,
        }
    }

    #[test]
    fn keys_sort_by_id() {
        assert!(face_key(FaceId(9)) < face_key(FaceId(10)));
        assert!(cluster_key(ClusterId(99)) < cluster_key(ClusterId(100)));
    }

    #[test]
    fn redb_apply_and_load() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("test.redb")).unwrap();

        store
            .apply(&Batch {
                put_faces: vec![face(10, Some(1)), face(9, Some(1))],
                put_clusters: vec![cluster(1)],
                ..Batch::default()
            })
            .unwrap();

        let snap = store.load().unwrap();
        assert_eq!(snap.faces.len(), 2);
        assert_eq!(snap.faces[0].id, FaceId(9));
        assert_eq!(snap.faces[1].encoding, vec![0.25, -0.5, 1.0]);
        assert_eq!(snap.faces[1].location.as_ref().unwrap()["w"], 30);
        assert_eq!(snap.clusters.len(), 1);
        assert_eq!(snap.clusters[0].name.as_deref(), Some("Alice"));
    }

    #[test]
    fn redb_deletes() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("test.redb")).unwrap();

        store
            .apply(&Batch {
                put_faces: vec![face(1, None), face(2, None)],
                put_clusters: vec![cluster(1), cluster(2)],
                ..Batch::default()
            })
            .unwrap();
        store
            .apply(&Batch {
                delete_faces: vec![FaceId(2)],
                delete_clusters: vec![ClusterId(1)],
                ..Batch::default()
            })
            .unwrap();

        let snap = store.load().unwrap();
        assert_eq!(snap.faces.len(), 1);
        assert_eq!(snap.faces[0].id, FaceId(1));
        assert_eq!(snap.clusters.len(), 1);
        assert_eq!(snap.clusters[0].id, ClusterId(2));
    }

    #[test]
    fn redb_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.redb");
        {
            let store = RedbStore::open(&path).unwrap();
            store
                .apply(&Batch {
                    put_faces: vec![face(1, Some(1))],
                    put_clusters: vec![cluster(1)],
                    ..Batch::default()
                })
                .unwrap();
        }

        let store = RedbStore::open(&path).unwrap();
        let snap = store.load().unwrap();
        assert_eq!(snap.faces.len(), 1);
        assert_eq!(snap.clusters.len(), 1);
    }
}
