//! Embedding distance.

use rayon::prelude::*;

use crate::error::{FaceError, Result};

/// Euclidean distance between two embeddings of the same dimension.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(FaceError::DimensionMismatch {
            expected: a.len(),
            found: b.len(),
        });
    }

    Ok(a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt())
}

/// Distance from `query` to every candidate, in candidate order.
///
/// Fails on the first dimension mismatch; no partial result is returned.
pub fn distances_to<'a, I>(query: &[f32], candidates: I) -> Result<Vec<f32>>
where
    I: IntoParallelIterator<Item = &'a [f32]>,
{
    candidates
        .into_par_iter()
        .map(|candidate| euclidean_distance(query, candidate))
        .collect()
}

/// Index and distance of the closest candidate. Ties go to the lowest index.
pub fn nearest(distances: &[f32]) -> Option<(usize, f32)> {
    distances
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (idx, distance)| match best {
            Some((_, best_distance)) if best_distance <= distance => best,
            _ => Some((idx, distance)),
        })
}
