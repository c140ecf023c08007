use std::collections::BTreeMap;

use crate::centroid::{self, ClusterStats};
use crate::error::{FaceClusterError, Result};
use crate::store::{Batch, Snapshot};
use crate::types::{Cluster, ClusterId, ClusterKind, Face, FaceId, FaceInput};

#[derive(Clone)]
struct Entry {
    cluster: Cluster,
    stats: ClusterStats,
}

/// Prior values of everything touched since [`Registry::begin`].
#[derive(Default)]
struct Journal {
    faces: BTreeMap<FaceId, Option<Face>>,
    clusters: BTreeMap<ClusterId, Option<Entry>>,
    next_face: u64,
    next_cluster: u64,
}

/// In-memory cluster registry.
///
/// Owns every cluster record and the cluster assignment of every face.
/// Mutations made between [`begin`](Self::begin) and
/// [`commit`](Self::commit) are journaled: [`pending`](Self::pending) yields
/// them as a store [`Batch`] and [`rollback`](Self::rollback) undoes them.
///
/// Not synchronized; the [`Manager`](crate::Manager) serializes access.
pub struct Registry {
    faces: BTreeMap<FaceId, Face>,
    clusters: BTreeMap<ClusterId, Entry>,
    images: BTreeMap<String, BTreeMap<u32, FaceId>>,
    next_face: u64,
    next_cluster: u64,
    journal: Option<Journal>,
}

/// What [`Registry::from_snapshot`] had to correct.
#[derive(Debug, Default)]
pub struct Repairs {
    /// Faces pointing at a cluster that does not exist.
    pub dangling_faces: usize,
    /// Clusters without members.
    pub empty_clusters: usize,
    /// Clusters whose stored encoding or photo count was stale.
    pub stale_clusters: usize,
    /// Changes to write back.
    pub batch: Batch,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            faces: BTreeMap::new(),
            clusters: BTreeMap::new(),
            images: BTreeMap::new(),
            next_face: 1,
            next_cluster: 1,
            journal: None,
        }
    }

    /// Rebuilds a registry from stored records, recomputing every cluster's
    /// statistics from its member faces.
    pub fn from_snapshot(snap: Snapshot) -> (Self, Repairs) {
        let mut reg = Self::new();
        let mut repairs = Repairs::default();

        for cluster in snap.clusters {
            reg.next_cluster = reg.next_cluster.max(cluster.id.0 + 1);
            reg.clusters.insert(
                cluster.id,
                Entry {
                    cluster,
                    stats: ClusterStats::default(),
                },
            );
        }

        for mut face in snap.faces {
            reg.next_face = reg.next_face.max(face.id.0 + 1);
            if let Some(cid) = face.cluster_id {
                match reg.clusters.get_mut(&cid) {
                    Some(entry) => {
                        entry.stats.add(&face);
                    }
                    None => {
                        face.cluster_id = None;
                        repairs.dangling_faces += 1;
                        repairs.batch.put_faces.push(face.clone());
                    }
                }
            }
            reg.images
                .entry(face.image_id.clone())
                .or_default()
                .insert(face.index, face.id);
            reg.faces.insert(face.id, face);
        }

        let empty: Vec<ClusterId> = reg
            .clusters
            .iter()
            .filter(|(_, e)| e.stats.is_empty())
            .map(|(id, _)| *id)
            .collect();
        for id in empty {
            reg.clusters.remove(&id);
            repairs.empty_clusters += 1;
            repairs.batch.delete_clusters.push(id);
        }

        for entry in reg.clusters.values_mut() {
            let stored = entry.cluster.representative_encoding.clone();
            let stored_count = entry.cluster.photo_count;
            centroid::refresh(&mut entry.cluster, &entry.stats);
            if stored_count != entry.cluster.photo_count
                || !approx_eq(&stored, &entry.cluster.representative_encoding)
            {
                repairs.stale_clusters += 1;
                repairs.batch.put_clusters.push(entry.cluster.clone());
            }
        }

        (reg, repairs)
    }

    // --- transactions ---

    /// Starts journaling. Any previous journal is discarded.
    pub fn begin(&mut self) {
        self.journal = Some(Journal {
            next_face: self.next_face,
            next_cluster: self.next_cluster,
            ..Journal::default()
        });
    }

    /// Returns the journaled changes as a store batch.
    pub fn pending(&self) -> Batch {
        let mut batch = Batch::default();
        let Some(journal) = &self.journal else {
            return batch;
        };
        for id in journal.faces.keys() {
            match self.faces.get(id) {
                Some(face) => batch.put_faces.push(face.clone()),
                None => batch.delete_faces.push(*id),
            }
        }
        for id in journal.clusters.keys() {
            match self.clusters.get(id) {
                Some(entry) => batch.put_clusters.push(entry.cluster.clone()),
                None => batch.delete_clusters.push(*id),
            }
        }
        batch
    }

    /// Keeps the journaled changes.
    pub fn commit(&mut self) {
        self.journal = None;
    }

    /// Restores every journaled record to its value at [`begin`](Self::begin).
    pub fn rollback(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };
        for (id, prior) in journal.faces {
            if let Some(current) = self.faces.remove(&id) {
                self.unindex_face(&current);
            }
            if let Some(face) = prior {
                self.images
                    .entry(face.image_id.clone())
                    .or_default()
                    .insert(face.index, face.id);
                self.faces.insert(id, face);
            }
        }
        for (id, prior) in journal.clusters {
            match prior {
                Some(entry) => {
                    self.clusters.insert(id, entry);
                }
                None => {
                    self.clusters.remove(&id);
                }
            }
        }
        self.next_face = journal.next_face;
        self.next_cluster = journal.next_cluster;
    }

    fn touch_face(&mut self, id: FaceId) {
        if let Some(journal) = &mut self.journal {
            if !journal.faces.contains_key(&id) {
                journal.faces.insert(id, self.faces.get(&id).cloned());
            }
        }
    }

    fn touch_cluster(&mut self, id: ClusterId) {
        if let Some(journal) = &mut self.journal {
            if !journal.clusters.contains_key(&id) {
                journal.clusters.insert(id, self.clusters.get(&id).cloned());
            }
        }
    }

    fn unindex_face(&mut self, face: &Face) {
        if let Some(by_index) = self.images.get_mut(&face.image_id) {
            if by_index.get(&face.index) != Some(&face.id) {
                return;
            }
            by_index.remove(&face.index);
            if by_index.is_empty() {
                self.images.remove(&face.image_id);
            }
        }
    }

    // --- faces ---

    pub fn face(&self, id: FaceId) -> Option<&Face> {
        self.faces.get(&id)
    }

    /// All faces in ascending id order.
    pub fn faces(&self) -> impl Iterator<Item = &Face> {
        self.faces.values()
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// Returns the face recorded for `image` at detector position `index`.
    pub fn face_at(&self, image: &str, index: u32) -> Option<FaceId> {
        self.images.get(image)?.get(&index).copied()
    }

    /// Returns every face of an image in detector order.
    pub fn faces_of_image(&self, image: &str) -> Vec<FaceId> {
        self.images
            .get(image)
            .map(|by_index| by_index.values().copied().collect())
            .unwrap_or_default()
    }

    /// Records a new unassigned face.
    pub fn insert_face(&mut self, image: &str, index: u32, input: &FaceInput) -> FaceId {
        let id = FaceId(self.next_face);
        self.next_face += 1;
        self.touch_face(id);
        let face = Face {
            id,
            image_id: image.to_string(),
            index,
            encoding: input.encoding.clone(),
            location: input.location.clone(),
            confidence: input.confidence,
            cluster_id: None,
        };
        self.images
            .entry(face.image_id.clone())
            .or_default()
            .insert(index, id);
        self.faces.insert(id, face);
        id
    }

    /// Deletes a face, detaching it from its cluster first.
    /// Returns the face and the cluster it left.
    pub fn remove_face(&mut self, id: FaceId) -> Result<(Face, Option<ClusterId>)> {
        let left = self.detach(id)?;
        self.touch_face(id);
        let face = self.faces.remove(&id).ok_or(FaceClusterError::FaceNotFound(id))?;
        self.unindex_face(&face);
        Ok((face, left))
    }

    // --- clusters ---

    pub fn cluster(&self, id: ClusterId) -> Option<&Cluster> {
        self.clusters.get(&id).map(|e| &e.cluster)
    }

    /// All clusters in ascending id order.
    pub fn clusters(&self) -> impl Iterator<Item = &Cluster> {
        self.clusters.values().map(|e| &e.cluster)
    }

    pub fn cluster_ids(&self) -> Vec<ClusterId> {
        self.clusters.keys().copied().collect()
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    /// Member faces of a cluster in ascending id order.
    pub fn members(&self, id: ClusterId) -> Result<Vec<FaceId>> {
        let entry = self
            .clusters
            .get(&id)
            .ok_or(FaceClusterError::ClusterNotFound(id))?;
        Ok(entry.stats.members().iter().copied().collect())
    }

    /// Creates an unnamed `person` cluster seeded with `seed` as its
    /// representative encoding. The caller must attach a face to it in the
    /// same transaction.
    pub fn create_cluster(&mut self, seed: &[f32]) -> ClusterId {
        let id = ClusterId(self.next_cluster);
        self.next_cluster += 1;
        self.touch_cluster(id);
        self.clusters.insert(
            id,
            Entry {
                cluster: Cluster {
                    id,
                    name: None,
                    kind: ClusterKind::Person,
                    representative_encoding: seed.to_vec(),
                    thumbnail: None,
                    photo_count: 0,
                },
                stats: ClusterStats::default(),
            },
        );
        id
    }

    /// Mutable access to a cluster's descriptive fields. Statistics are
    /// managed by [`attach`](Self::attach) and [`detach`](Self::detach).
    pub fn cluster_mut(&mut self, id: ClusterId) -> Result<&mut Cluster> {
        if !self.clusters.contains_key(&id) {
            return Err(FaceClusterError::ClusterNotFound(id));
        }
        self.touch_cluster(id);
        self.clusters
            .get_mut(&id)
            .map(|e| &mut e.cluster)
            .ok_or(FaceClusterError::ClusterNotFound(id))
    }

    /// Attaches an unassigned face to a cluster and refreshes the cluster's
    /// representative encoding and photo count.
    pub fn attach(&mut self, face_id: FaceId, cluster_id: ClusterId) -> Result<()> {
        if !self.faces.contains_key(&face_id) {
            return Err(FaceClusterError::FaceNotFound(face_id));
        }
        if !self.clusters.contains_key(&cluster_id) {
            return Err(FaceClusterError::ClusterNotFound(cluster_id));
        }
        if self.faces[&face_id].cluster_id.is_some() {
            self.detach(face_id)?;
        }
        self.touch_face(face_id);
        self.touch_cluster(cluster_id);

        let (Some(face), Some(entry)) = (
            self.faces.get_mut(&face_id),
            self.clusters.get_mut(&cluster_id),
        ) else {
            return Err(FaceClusterError::FaceNotFound(face_id));
        };
        face.cluster_id = Some(cluster_id);
        entry.stats.add(face);
        centroid::refresh(&mut entry.cluster, &entry.stats);
        Ok(())
    }

    /// Detaches a face from its cluster, if any. The cluster stays in the
    /// registry even when emptied; callers delete it in the same transaction.
    pub fn detach(&mut self, face_id: FaceId) -> Result<Option<ClusterId>> {
        let cluster_id = self
            .faces
            .get(&face_id)
            .ok_or(FaceClusterError::FaceNotFound(face_id))?
            .cluster_id;
        let Some(cluster_id) = cluster_id else {
            return Ok(None);
        };
        self.touch_face(face_id);
        self.touch_cluster(cluster_id);

        if let Some(face) = self.faces.get_mut(&face_id) {
            face.cluster_id = None;
            if let Some(entry) = self.clusters.get_mut(&cluster_id) {
                entry.stats.remove(face);
                centroid::refresh(&mut entry.cluster, &entry.stats);
            }
        }
        Ok(Some(cluster_id))
    }

    /// Recomputes a cluster's statistics from its members from scratch.
    pub fn recompute(&mut self, id: ClusterId) -> Result<()> {
        let members = self.members(id)?;
        self.touch_cluster(id);
        let stats = centroid::recompute(members.iter().filter_map(|fid| self.faces.get(fid)));
        if let Some(entry) = self.clusters.get_mut(&id) {
            centroid::refresh(&mut entry.cluster, &stats);
            entry.stats = stats;
        }
        Ok(())
    }

    /// Detaches every remaining member and deletes the cluster.
    /// Returns the removed record and the faces it released.
    pub fn remove_cluster(&mut self, id: ClusterId) -> Result<(Cluster, Vec<FaceId>)> {
        let members = self.members(id)?;
        for fid in &members {
            self.detach(*fid)?;
        }
        self.touch_cluster(id);
        let entry = self
            .clusters
            .remove(&id)
            .ok_or(FaceClusterError::ClusterNotFound(id))?;
        Ok((entry.cluster, members))
    }

    /// Detaches every face and deletes every cluster.
    pub fn reset(&mut self) {
        let face_ids: Vec<FaceId> = self.faces.keys().copied().collect();
        for id in face_ids {
            if self.faces[&id].cluster_id.is_some() {
                self.touch_face(id);
                if let Some(face) = self.faces.get_mut(&id) {
                    face.cluster_id = None;
                }
            }
        }
        for id in self.cluster_ids() {
            self.touch_cluster(id);
        }
        self.clusters.clear();
    }

    /// Returns the face of `cluster` with the highest confidence, lowest id
    /// first on ties.
    pub fn best_exemplar(&self, id: ClusterId) -> Option<&Face> {
        let entry = self.clusters.get(&id)?;
        entry
            .stats
            .members()
            .iter()
            .filter_map(|fid| self.faces.get(fid))
            .fold(None, |best: Option<&Face>, f| match best {
                Some(b) if b.confidence >= f.confidence => Some(b),
                _ => Some(f),
            })
    }
}

fn approx_eq(a: &[f32], b: &[f32]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() <= 1e-5)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(encoding: Vec<f32>) -> FaceInput {
        FaceInput {
            encoding,
            location: None,
            confidence: 0.9,
        }
    }

    #[test]
    fn attach_updates_centroid_and_photo_count() {
        let mut reg = Registry::new();
        let a = reg.insert_face("img1", 0, &input(vec![1.0, 0.0]));
        let b = reg.insert_face("img1", 1, &input(vec![0.0, 1.0]));
        let c = reg.insert_face("img2", 0, &input(vec![1.0, 1.0]));

        let cid = reg.create_cluster(&[1.0, 0.0]);
        reg.attach(a, cid).unwrap();
        reg.attach(b, cid).unwrap();
        reg.attach(c, cid).unwrap();

        let cluster = reg.cluster(cid).unwrap();
        assert_eq!(cluster.photo_count, 2);
        let rep = &cluster.representative_encoding;
        assert!((rep[0] - 2.0 / 3.0).abs() < 1e-6 && (rep[1] - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(reg.members(cid).unwrap(), vec![a, b, c]);
        assert_eq!(reg.face(a).unwrap().cluster_id, Some(cid));
    }

    #[test]
    fn attach_moves_assigned_face() {
        let mut reg = Registry::new();
        let a = reg.insert_face("img1", 0, &input(vec![1.0, 0.0]));
        let c1 = reg.create_cluster(&[1.0, 0.0]);
        let c2 = reg.create_cluster(&[1.0, 0.0]);
        reg.attach(a, c1).unwrap();
        reg.attach(a, c2).unwrap();

        assert!(reg.members(c1).unwrap().is_empty());
        assert_eq!(reg.members(c2).unwrap(), vec![a]);
        assert_eq!(reg.cluster(c1).unwrap().photo_count, 0);
    }

    #[test]
    fn rollback_restores_everything() {
        let mut reg = Registry::new();
        let a = reg.insert_face("img1", 0, &input(vec![1.0, 0.0]));
        let c1 = reg.create_cluster(&[1.0, 0.0]);
        reg.attach(a, c1).unwrap();

        reg.begin();
        let b = reg.insert_face("img2", 0, &input(vec![0.0, 1.0]));
        let c2 = reg.create_cluster(&[0.0, 1.0]);
        reg.attach(b, c2).unwrap();
        reg.attach(a, c2).unwrap();
        reg.remove_cluster(c1).unwrap();
        reg.rollback();

        assert!(reg.face(b).is_none());
        assert!(reg.face_at("img2", 0).is_none());
        assert!(reg.cluster(c2).is_none());
        assert_eq!(reg.face(a).unwrap().cluster_id, Some(c1));
        assert_eq!(reg.members(c1).unwrap(), vec![a]);
        assert_eq!(reg.cluster(c1).unwrap().photo_count, 1);

        // Ids handed out inside the rolled back transaction are reused.
        let again = reg.insert_face("img3", 0, &input(vec![1.0]));
        assert_eq!(again, b);
    }

    #[test]
    fn pending_lists_puts_and_deletes() {
        let mut reg = Registry::new();
        let a = reg.insert_face("img1", 0, &input(vec![1.0, 0.0]));
        let c1 = reg.create_cluster(&[1.0, 0.0]);
        reg.attach(a, c1).unwrap();

        reg.begin();
        let c2 = reg.create_cluster(&[1.0, 0.0]);
        reg.attach(a, c2).unwrap();
        reg.remove_cluster(c1).unwrap();
        let batch = reg.pending();
        reg.commit();

        assert_eq!(batch.put_faces.len(), 1);
        assert_eq!(batch.put_faces[0].cluster_id, Some(c2));
        assert_eq!(batch.put_clusters.len(), 1);
        assert_eq!(batch.put_clusters[0].id, c2);
        assert_eq!(batch.delete_clusters, vec![c1]);
        assert!(reg.pending().is_empty(), "nothing pending after commit");
    }

    #[test]
    fn remove_cluster_releases_faces() {
        let mut reg = Registry::new();
        let a = reg.insert_face("img1", 0, &input(vec![1.0, 0.0]));
        let b = reg.insert_face("img2", 0, &input(vec![1.0, 0.0]));
        let cid = reg.create_cluster(&[1.0, 0.0]);
        reg.attach(a, cid).unwrap();
        reg.attach(b, cid).unwrap();

        let (cluster, released) = reg.remove_cluster(cid).unwrap();
        assert_eq!(cluster.id, cid);
        assert_eq!(released, vec![a, b]);
        assert!(reg.cluster(cid).is_none());
        assert_eq!(reg.face(a).unwrap().cluster_id, None);
        assert_eq!(reg.face_count(), 2);
    }

    #[test]
    fn remove_face_updates_index_and_cluster() {
        let mut reg = Registry::new();
        let a = reg.insert_face("img1", 0, &input(vec![1.0, 0.0]));
        let b = reg.insert_face("img1", 1, &input(vec![3.0, 0.0]));
        let cid = reg.create_cluster(&[1.0, 0.0]);
        reg.attach(a, cid).unwrap();
        reg.attach(b, cid).unwrap();

        let (face, left) = reg.remove_face(a).unwrap();
        assert_eq!(face.id, a);
        assert_eq!(left, Some(cid));
        assert_eq!(reg.faces_of_image("img1"), vec![b]);
        assert_eq!(reg.cluster(cid).unwrap().representative_encoding, vec![3.0, 0.0]);
    }

    #[test]
    fn reset_detaches_all() {
        let mut reg = Registry::new();
        let a = reg.insert_face("img1", 0, &input(vec![1.0, 0.0]));
        let cid = reg.create_cluster(&[1.0, 0.0]);
        reg.attach(a, cid).unwrap();

        reg.begin();
        reg.reset();
        assert_eq!(reg.cluster_count(), 0);
        assert!(reg.faces().all(|f| f.cluster_id.is_none()));
        let batch = reg.pending();
        assert_eq!(batch.delete_clusters, vec![cid]);
        assert_eq!(batch.put_faces.len(), 1);
        reg.rollback();
        assert_eq!(reg.face(a).unwrap().cluster_id, Some(cid));
    }

    #[test]
    fn from_snapshot_repairs_inconsistencies() {
        let face = |id: u64, cluster: Option<u64>| Face {
            id: FaceId(id),
            image_id: format!("img{id}"),
            index: 0,
            encoding: vec![id as f32, 0.0],
            location: None,
            confidence: 0.5,
            cluster_id: cluster.map(ClusterId),
        };
        let cluster = |id: u64| Cluster {
            id: ClusterId(id),
            name: None,
            kind: ClusterKind::Person,
            representative_encoding: vec![0.0, 0.0],
            thumbnail: None,
            photo_count: 0,
        };
        let snap = Snapshot {
            faces: vec![face(1, Some(1)), face(3, Some(1)), face(4, Some(9))],
            clusters: vec![cluster(1), cluster(2)],
        };

        let (mut reg, repairs) = Registry::from_snapshot(snap);
        assert_eq!(repairs.dangling_faces, 1);
        assert_eq!(repairs.empty_clusters, 1);
        assert_eq!(repairs.stale_clusters, 1);
        assert_eq!(reg.cluster(ClusterId(1)).unwrap().representative_encoding, vec![2.0, 0.0]);
        assert_eq!(reg.cluster(ClusterId(1)).unwrap().photo_count, 2);
        assert!(reg.cluster(ClusterId(2)).is_none());
        assert_eq!(reg.face(FaceId(4)).unwrap().cluster_id, None);

        // New ids continue after the highest stored ones.
        assert_eq!(reg.insert_face("x", 0, &input(vec![1.0])), FaceId(5));
        assert_eq!(reg.create_cluster(&[1.0]), ClusterId(3));
    }

    #[test]
    fn best_exemplar_prefers_confidence() {
        let mut reg = Registry::new();
        let low = reg.insert_face("img1", 0, &FaceInput { confidence: 0.3, ..input(vec![1.0]) });
        let high = reg.insert_face("img2", 0, &FaceInput { confidence: 0.8, ..input(vec![1.0]) });
        let cid = reg.create_cluster(&[1.0]);
        reg.attach(low, cid).unwrap();
        reg.attach(high, cid).unwrap();
        assert_eq!(reg.best_exemplar(cid).unwrap().id, high);
    }
}
