use std::collections::{BTreeMap, BTreeSet};

use crate::types::{Cluster, Face, FaceId};

/// Running statistics for one cluster's members.
///
/// Keeps a per-component sum and count so the mean can be produced without
/// revisiting every member. Component `i` is averaged over the members whose
/// encoding has at least `i + 1` components; for equal-length members this is
/// the plain arithmetic mean.
#[derive(Debug, Clone, Default)]
pub struct ClusterStats {
    sum: Vec<f64>,
    counts: Vec<usize>,
    images: BTreeMap<String, usize>,
    members: BTreeSet<FaceId>,
}

impl ClusterStats {
    /// Adds a face. Returns false if it was already a member.
    pub fn add(&mut self, face: &Face) -> bool {
        if !self.members.insert(face.id) {
            return false;
        }
        if self.sum.len() < face.encoding.len() {
            self.sum.resize(face.encoding.len(), 0.0);
            self.counts.resize(face.encoding.len(), 0);
        }
        for (i, &x) in face.encoding.iter().enumerate() {
            self.sum[i] += x as f64;
            self.counts[i] += 1;
        }
        *self.images.entry(face.image_id.clone()).or_insert(0) += 1;
        true
    }

    /// Removes a face. Returns false if it was not a member.
    pub fn remove(&mut self, face: &Face) -> bool {
        if !self.members.remove(&face.id) {
            return false;
        }
        for (i, &x) in face.encoding.iter().enumerate() {
            self.counts[i] -= 1;
            if self.counts[i] == 0 {
                self.sum[i] = 0.0;
            } else {
                self.sum[i] -= x as f64;
            }
        }
        // Counts never increase with the index, so empty components form a suffix.
        let used = self.counts.iter().take_while(|&&c| c > 0).count();
        self.sum.truncate(used);
        self.counts.truncate(used);

        if let Some(n) = self.images.get_mut(&face.image_id) {
            *n -= 1;
            if *n == 0 {
                self.images.remove(&face.image_id);
            }
        }
        true
    }

    /// Component-wise mean of the member encodings.
    pub fn mean(&self) -> Vec<f32> {
        self.sum
            .iter()
            .zip(self.counts.iter())
            .map(|(&s, &c)| (s / c as f64) as f32)
            .collect()
    }

    /// Number of distinct images among the members.
    pub fn photo_count(&self) -> usize {
        self.images.len()
    }

    pub fn members(&self) -> &BTreeSet<FaceId> {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Rebuilds statistics from scratch over the given member faces.
pub fn recompute<'a, I>(faces: I) -> ClusterStats
where
    I: IntoIterator<Item = &'a Face>,
{
    let mut stats = ClusterStats::default();
    for face in faces {
        stats.add(face);
    }
    stats
}

/// Writes the representative encoding and photo count of `stats` into the
/// cluster record. An empty cluster keeps its last encoding; it is about to
/// be deleted.
pub fn refresh(cluster: &mut Cluster, stats: &ClusterStats) {
    if !stats.is_empty() {
        cluster.representative_encoding = stats.mean();
    }
    cluster.photo_count = stats.photo_count();
}
