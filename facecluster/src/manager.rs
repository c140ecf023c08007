use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::{self, Config, DimensionPolicy};
use crate::error::{FaceClusterError, Result};
use crate::matcher;
use crate::registry::Registry;
use crate::store::{ClusterStore, MemoryStore};
use crate::types::{
    Cluster, ClusterId, ClusterKind, ClusterSummary, Face, FaceAssignment, FaceId, FaceInput,
};
use crate::vector;

struct State {
    registry: Registry,
    threshold: f32,
}

/// Owns the cluster registry and serializes every mutation of it.
///
/// Thread-safe: all methods can be called concurrently. Each mutation runs
/// under one exclusive lock over the whole registry, from the matcher read to
/// the store write, so two workers can never both decide to create a cluster
/// for the same identity. Queries take a shared lock.
///
/// Every mutation is all-or-nothing: changes are written to the
/// [`ClusterStore`] as one batch, and if that write fails the in-memory
/// registry is rolled back before the error is returned.
pub struct Manager {
    state: RwLock<State>,
    store: Box<dyn ClusterStore>,
    cfg: Config,
}

impl Manager {
    /// Creates a Manager over an empty in-memory store.
    pub fn new(cfg: Config) -> Result<Self> {
        Self::open(cfg, Box::new(MemoryStore::new()))
    }

    /// Opens a Manager over `store`, rebuilding the registry from its
    /// contents. Stale statistics, dangling face references and empty
    /// clusters found in the store are repaired and written back.
    pub fn open(cfg: Config, store: Box<dyn ClusterStore>) -> Result<Self> {
        let cfg = cfg.with_defaults();
        cfg.validate()?;

        let snap = store.load()?;
        let (registry, repairs) = Registry::from_snapshot(snap);
        if !repairs.batch.is_empty() {
            warn!(
                dangling_faces = repairs.dangling_faces,
                empty_clusters = repairs.empty_clusters,
                stale_clusters = repairs.stale_clusters,
                "repairing stored clusters"
            );
            store.apply(&repairs.batch)?;
        }
        info!(
            faces = registry.face_count(),
            clusters = registry.cluster_count(),
            threshold = cfg.threshold,
            "cluster registry loaded"
        );

        Ok(Self {
            state: RwLock::new(State {
                registry,
                threshold: cfg.threshold,
            }),
            store,
            cfg,
        })
    }

    /// Returns the configuration the Manager was opened with. The active
    /// threshold may differ; see [`threshold`](Self::threshold).
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Returns the active matching threshold.
    pub fn threshold(&self) -> f32 {
        self.state.read().threshold
    }

    /// Sets the matching threshold for subsequent assignments, clamped into
    /// `[0.4, 0.8]`. Existing clusters are not re-evaluated. Returns the
    /// effective threshold. NaN is ignored.
    pub fn set_threshold(&self, t: f32) -> f32 {
        let mut st = self.state.write();
        if t.is_nan() {
            warn!(current = st.threshold, "ignoring NaN threshold");
            return st.threshold;
        }
        let effective = config::clamp_threshold(t);
        if effective != t {
            warn!(requested = t, effective, "threshold clamped");
        }
        info!(from = st.threshold, to = effective, "threshold changed");
        st.threshold = effective;
        effective
    }

    // --- ingestion ---

    /// Records and assigns every face detected in one image, in list order.
    ///
    /// The image is validated and recorded under one exclusive lock, and
    /// each face is its own transaction. Retrying an image reuses the faces
    /// already recorded at the same detector positions, so a retry never
    /// creates duplicate faces or memberships.
    pub fn process_faces(&self, image: &str, faces: &[FaceInput]) -> Result<Vec<FaceAssignment>> {
        let mut st = self.state.write();
        let expected = self.expected_dimension(&st.registry, faces);
        for input in faces {
            self.check_dimension(expected, &input.encoding)?;
        }

        let threshold = st.threshold;
        let mut out = Vec::with_capacity(faces.len());
        for (index, input) in faces.iter().enumerate() {
            let index = index as u32;
            let assignment = self.transact(&mut st.registry, |reg| {
                let face_id = match reg.face_at(image, index) {
                    Some(id) => id,
                    None => reg.insert_face(image, index, input),
                };
                let cluster_id = self.assign_locked(reg, face_id, threshold)?;
                Ok(FaceAssignment {
                    face_id,
                    cluster_id,
                })
            })?;
            out.push(assignment);
        }
        Ok(out)
    }

    /// Assigns a recorded face to its best matching cluster, creating a new
    /// cluster when nothing reaches the threshold. A face that already has a
    /// cluster keeps it.
    pub fn assign_face(&self, face_id: FaceId) -> Result<ClusterId> {
        let mut st = self.state.write();
        let threshold = st.threshold;
        self.transact(&mut st.registry, |reg| {
            self.assign_locked(reg, face_id, threshold)
        })
    }

    fn assign_locked(&self, reg: &mut Registry, face_id: FaceId, threshold: f32) -> Result<ClusterId> {
        let face = reg
            .face(face_id)
            .ok_or(FaceClusterError::FaceNotFound(face_id))?;
        if let Some(cid) = face.cluster_id {
            debug!(face = %face_id, cluster = %cid, "face already assigned");
            return Ok(cid);
        }
        let encoding = face.encoding.clone();
        let image = face.image_id.clone();
        let confidence = face.confidence;

        if vector::is_degenerate(&encoding) {
            warn!(face = %face_id, image = %image, len = encoding.len(), "degenerate encoding, it will not match any cluster");
        }

        let cluster_id = match matcher::find_best_cluster(&encoding, reg.clusters(), threshold) {
            Some(m) => {
                debug!(face = %face_id, cluster = %m.cluster_id, similarity = m.similarity, "matched cluster");
                m.cluster_id
            }
            None => {
                let cid = reg.create_cluster(&encoding);
                info!(face = %face_id, cluster = %cid, image = %image, "created cluster");
                cid
            }
        };
        reg.attach(face_id, cluster_id)?;

        let min_conf = self.cfg.thumbnail_confidence;
        let cluster = reg.cluster_mut(cluster_id)?;
        if cluster.thumbnail.is_none() || confidence > min_conf {
            cluster.thumbnail = Some(image);
        }
        Ok(cluster_id)
    }

    /// The configured dimension, else the first recorded face's, else the
    /// first face of the incoming image.
    fn expected_dimension(&self, reg: &Registry, faces: &[FaceInput]) -> Option<usize> {
        if self.cfg.dim > 0 {
            return Some(self.cfg.dim);
        }
        reg.faces()
            .next()
            .map(|f| f.encoding.len())
            .or_else(|| faces.first().map(|f| f.encoding.len()))
    }

    fn check_dimension(&self, expected: Option<usize>, encoding: &[f32]) -> Result<()> {
        let Some(expected) = expected else {
            return Ok(());
        };
        if encoding.len() == expected {
            return Ok(());
        }
        match self.cfg.dimension_policy {
            DimensionPolicy::Reject => Err(FaceClusterError::DimensionMismatch {
                expected,
                got: encoding.len(),
            }),
            DimensionPolicy::Truncate => {
                warn!(expected, got = encoding.len(), "encoding dimension mismatch, comparing shared prefix");
                Ok(())
            }
        }
    }

    // --- administration ---

    /// Moves every face of `absorb` into `keep` and deletes `absorb`.
    ///
    /// `keep` inherits `absorb`'s name when it has none, and its thumbnail
    /// likewise. Returns the surviving cluster.
    pub fn merge_clusters(&self, keep: ClusterId, absorb: ClusterId) -> Result<Cluster> {
        if keep == absorb {
            return Err(FaceClusterError::SameCluster(keep));
        }
        let mut st = self.state.write();
        let merged = self.transact(&mut st.registry, |reg| {
            let absorbed = reg
                .cluster(absorb)
                .cloned()
                .ok_or(FaceClusterError::ClusterNotFound(absorb))?;
            if reg.cluster(keep).is_none() {
                return Err(FaceClusterError::ClusterNotFound(keep));
            }

            for fid in reg.members(absorb)? {
                reg.attach(fid, keep)?;
            }
            reg.remove_cluster(absorb)?;
            reg.recompute(keep)?;

            let target = reg.cluster_mut(keep)?;
            if target.name.is_none() && absorbed.name.is_some() {
                target.name = absorbed.name;
            }
            if target.thumbnail.is_none() {
                target.thumbnail = absorbed.thumbnail;
            }
            Ok(target.clone())
        })?;
        info!(keep = %keep, absorb = %absorb, photo_count = merged.photo_count, "merged clusters");
        Ok(merged)
    }

    /// Deletes a cluster. Its faces stay recorded and become unassigned.
    /// Returns the released faces.
    pub fn delete_cluster(&self, id: ClusterId) -> Result<Vec<FaceId>> {
        let mut st = self.state.write();
        let released = self.transact(&mut st.registry, |reg| {
            let (_, released) = reg.remove_cluster(id)?;
            Ok(released)
        })?;
        info!(cluster = %id, released = released.len(), "deleted cluster");
        Ok(released)
    }

    /// Sets or clears a cluster's display name. Blank names clear it.
    pub fn rename_cluster(&self, id: ClusterId, name: Option<&str>) -> Result<Cluster> {
        let name = name.map(str::trim).filter(|n| !n.is_empty()).map(String::from);
        let mut st = self.state.write();
        let renamed = self.transact(&mut st.registry, |reg| {
            let cluster = reg.cluster_mut(id)?;
            cluster.name = name;
            Ok(cluster.clone())
        })?;
        info!(cluster = %id, name = ?renamed.name, "renamed cluster");
        Ok(renamed)
    }

    /// Corrects what a cluster depicts.
    pub fn set_type(&self, id: ClusterId, kind: ClusterKind) -> Result<Cluster> {
        let mut st = self.state.write();
        let updated = self.transact(&mut st.registry, |reg| {
            let cluster = reg.cluster_mut(id)?;
            cluster.kind = kind;
            Ok(cluster.clone())
        })?;
        info!(cluster = %id, kind = %kind, "changed cluster type");
        Ok(updated)
    }

    /// Removes every face of an image that was deleted upstream. Clusters
    /// left without members are deleted; clusters that used the image as
    /// thumbnail pick their most confident remaining face instead.
    /// Returns the number of faces removed.
    pub fn forget_image(&self, image: &str) -> Result<usize> {
        let mut st = self.state.write();
        let removed = self.transact(&mut st.registry, |reg| {
            let face_ids = reg.faces_of_image(image);
            let mut affected = Vec::new();
            for fid in &face_ids {
                if let (_, Some(cid)) = reg.remove_face(*fid)? {
                    if !affected.contains(&cid) {
                        affected.push(cid);
                    }
                }
            }
            for cid in affected {
                if reg.members(cid)?.is_empty() {
                    reg.remove_cluster(cid)?;
                    info!(cluster = %cid, image, "deleted emptied cluster");
                    continue;
                }
                let uses_image = reg
                    .cluster(cid)
                    .is_some_and(|c| c.thumbnail.as_deref() == Some(image));
                if uses_image {
                    let replacement = reg.best_exemplar(cid).map(|f| f.image_id.clone());
                    reg.cluster_mut(cid)?.thumbnail = replacement;
                }
            }
            Ok(face_ids.len())
        })?;
        if removed > 0 {
            info!(image, faces = removed, "forgot image");
        }
        Ok(removed)
    }

    /// Rebuilds every cluster from scratch.
    ///
    /// Detaches all faces, deletes all clusters and re-assigns the faces in
    /// ascending id order under the active threshold, so the result depends
    /// only on the face set and the threshold. Holds the exclusive lock for
    /// the whole rebuild, which is committed as one batch or not at all.
    /// Returns the number of clusters.
    pub fn recluster_all(&self) -> Result<usize> {
        let mut st = self.state.write();
        let threshold = st.threshold;
        let carry_labels = self.cfg.carry_labels;
        let (clusters, carried) = self.transact(&mut st.registry, |reg| {
            let previous: BTreeMap<FaceId, ClusterId> = reg
                .faces()
                .filter_map(|f| f.cluster_id.map(|cid| (f.id, cid)))
                .collect();
            let labels: BTreeMap<ClusterId, (Option<String>, ClusterKind)> = reg
                .clusters()
                .filter(|c| c.name.is_some() || c.kind != ClusterKind::Person)
                .map(|c| (c.id, (c.name.clone(), c.kind)))
                .collect();

            reg.reset();
            let face_ids: Vec<FaceId> = reg.faces().map(|f| f.id).collect();
            for fid in face_ids {
                self.assign_locked(reg, fid, threshold)?;
            }
            for cid in reg.cluster_ids() {
                reg.recompute(cid)?;
            }

            let carried = if carry_labels {
                carry_over_labels(reg, &previous, &labels)?
            } else {
                0
            };
            Ok((reg.cluster_count(), carried))
        })?;
        info!(clusters, carried, threshold, "reclustered all faces");
        Ok(clusters)
    }

    // --- queries ---

    /// Display summaries of every cluster in ascending id order.
    pub fn clusters(&self) -> Vec<ClusterSummary> {
        let st = self.state.read();
        st.registry.clusters().map(Cluster::summary).collect()
    }

    pub fn cluster(&self, id: ClusterId) -> Option<Cluster> {
        self.state.read().registry.cluster(id).cloned()
    }

    /// Member faces of a cluster in ascending id order.
    pub fn faces_in(&self, id: ClusterId) -> Result<Vec<Face>> {
        let st = self.state.read();
        let members = st.registry.members(id)?;
        Ok(members
            .iter()
            .filter_map(|fid| st.registry.face(*fid).cloned())
            .collect())
    }

    pub fn face(&self, id: FaceId) -> Option<Face> {
        self.state.read().registry.face(id).cloned()
    }

    /// Faces that currently belong to no cluster.
    pub fn unassigned_faces(&self) -> Vec<Face> {
        let st = self.state.read();
        st.registry
            .faces()
            .filter(|f| f.cluster_id.is_none())
            .cloned()
            .collect()
    }

    /// Every face's current assignment, in ascending face id order.
    pub fn assignments(&self) -> Vec<(FaceId, Option<ClusterId>)> {
        let st = self.state.read();
        st.registry.faces().map(|f| (f.id, f.cluster_id)).collect()
    }

    /// Returns the number of recorded faces.
    pub fn len(&self) -> usize {
        self.state.read().registry.face_count()
    }

    /// Returns true if no faces are recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `f` as one registry transaction: journal, persist, and roll
    /// back on any failure.
    fn transact<T>(&self, reg: &mut Registry, f: impl FnOnce(&mut Registry) -> Result<T>) -> Result<T> {
        reg.begin();
        let out = match f(reg) {
            Ok(out) => out,
            Err(e) => {
                reg.rollback();
                return Err(e);
            }
        };
        let batch = reg.pending();
        if !batch.is_empty() {
            if let Err(e) = self.store.apply(&batch) {
                warn!(error = %e, records = batch.len(), "store write failed, rolling back");
                reg.rollback();
                return Err(e);
            }
        }
        reg.commit();
        Ok(out)
    }
}

/// Gives each rebuilt cluster the name and type of the labeled previous
/// cluster most of its faces came from. Unlabeled previous clusters do not
/// vote. Each previous label is used once, by the lowest rebuilt cluster id
/// that claims it. Returns how many clusters were labeled.
fn carry_over_labels(
    reg: &mut Registry,
    previous: &BTreeMap<FaceId, ClusterId>,
    labels: &BTreeMap<ClusterId, (Option<String>, ClusterKind)>,
) -> Result<usize> {
    if labels.is_empty() {
        return Ok(0);
    }
    let mut used: BTreeSet<ClusterId> = BTreeSet::new();
    let mut carried = 0;
    for cid in reg.cluster_ids() {
        let mut votes: BTreeMap<ClusterId, usize> = BTreeMap::new();
        for fid in reg.members(cid)? {
            let labeled = previous
                .get(&fid)
                .filter(|old| labels.contains_key(*old) && !used.contains(*old));
            if let Some(old) = labeled {
                *votes.entry(*old).or_insert(0) += 1;
            }
        }
        // Highest vote wins; BTreeMap order makes the lowest old id win ties.
        let winner = votes
            .iter()
            .fold(None, |best: Option<(ClusterId, usize)>, (&old, &n)| match best {
                Some((_, m)) if m >= n => best,
                _ => Some((old, n)),
            })
            .map(|(old, _)| old);
        let Some(old) = winner else {
            continue;
        };
        let Some((name, kind)) = labels.get(&old) else {
            continue;
        };
        used.insert(old);
        let cluster = reg.cluster_mut(cid)?;
        cluster.name = name.clone();
        cluster.kind = *kind;
        carried += 1;
    }
    Ok(carried)
}
