//! Similarity and distance over embedding vectors.
//!
//! Vectors of different lengths are compared over their shared prefix,
//! `min(a.len(), b.len())`. Callers that want mismatches treated as errors
//! check lengths before calling in (see [`DimensionPolicy`](crate::DimensionPolicy)).

/// Cosine similarity between two vectors, in `[-1, 1]`.
///
/// Returns 0.0 when either vector is empty or has zero magnitude over the
/// compared prefix. Uses f64 intermediate precision.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }

    let mut dot: f64 = 0.0;
    let mut na: f64 = 0.0;
    let mut nb: f64 = 0.0;
    for i in 0..n {
        let ai = a[i] as f64;
        let bi = b[i] as f64;
        dot += ai * bi;
        na += ai * ai;
        nb += bi * bi;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom == 0.0 || !denom.is_finite() {
        return 0.0;
    }
    (dot / denom).clamp(-1.0, 1.0) as f32
}

/// Euclidean distance over the shared prefix.
/// Returns `f32::MAX` when either vector is empty.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() {
        return f32::MAX;
    }
    let sum: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = x as f64 - y as f64;
            d * d
        })
        .sum();
    sum.sqrt() as f32
}

/// Reports whether a vector can never match anything: empty, zero
/// magnitude, or containing a non-finite component.
pub fn is_degenerate(v: &[f32]) -> bool {
    if v.iter().any(|x| !x.is_finite()) {
        return true;
    }
    !v.iter().any(|&x| x != 0.0)
}
