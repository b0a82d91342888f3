//! Brute-force similarity search over stored face embeddings.
//!
//! Every query scans a fresh snapshot of the store, so results never
//! include faces committed after the scan started. An approximate index can
//! replace the scan behind [`SimilarityIndex::query`] without touching
//! callers.

use rayon::prelude::*;
use std::sync::Arc;

use super::distance::distances_to;
use crate::db::{Face, RecordStore};
use crate::error::Result;

/// A stored face and its distance to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceMatch {
    pub face: Face,
    pub distance: f32,
}

#[derive(Clone)]
pub struct SimilarityIndex {
    store: Arc<dyn RecordStore>,
}

impl SimilarityIndex {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Stored faces within `base_threshold * search_multiplier` of
    /// `embedding`, closest first. Equal distances keep insertion order.
    pub fn query(
        &self,
        embedding: &[f32],
        base_threshold: f32,
        search_multiplier: f32,
    ) -> Result<SimilarityMatches> {
        let threshold = base_threshold * search_multiplier;
        let faces = self.store.all_face_embeddings()?;
        let distances = distances_to(embedding, faces.par_iter().map(|f| f.embedding.as_slice()))?;

        let mut matches: Vec<FaceMatch> = faces
            .into_iter()
            .zip(distances)
            .filter(|(_, distance)| *distance <= threshold)
            .map(|(face, distance)| FaceMatch { face, distance })
            .collect();

        // stable sort: ties stay in insertion order
        matches.sort_by(|a, b| a.distance.total_cmp(&b.distance));

        Ok(SimilarityMatches {
            inner: matches.into_iter(),
        })
    }
}

/// Ranked matches of one query. Consumed once; query again for a new scan.
#[derive(Debug)]
pub struct SimilarityMatches {
    inner: std::vec::IntoIter<FaceMatch>,
}

impl Iterator for SimilarityMatches {
    type Item = FaceMatch;

    fn next(&mut self) -> Option<FaceMatch> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for SimilarityMatches {}
