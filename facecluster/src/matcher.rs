use crate::types::{Cluster, ClusterId};
use crate::vector::cosine_similarity;

/// The cluster chosen for an encoding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match {
    pub cluster_id: ClusterId,
    pub similarity: f32,
}

/// Finds the cluster whose representative encoding is most similar to
/// `encoding`, if that similarity reaches `threshold`.
///
/// Clusters without a representative encoding are skipped. On an exact tie
/// the first cluster yielded by `clusters` wins, so callers must iterate in a
/// stable order (the registry yields ascending cluster ids).
pub fn find_best_cluster<'a, I>(encoding: &[f32], clusters: I, threshold: f32) -> Option<Match>
where
    I: IntoIterator<Item = &'a Cluster>,
{
    let mut best: Option<Match> = None;
    for c in clusters {
        if c.representative_encoding.is_empty() {
            continue;
        }
        let sim = cosine_similarity(encoding, &c.representative_encoding);
        if best.is_none_or(|b| sim > b.similarity) {
            best = Some(Match {
                cluster_id: c.id,
                similarity: sim,
            });
        }
    }
    best.filter(|b| b.similarity >= threshold)
}
