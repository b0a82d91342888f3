//! The seam between the index and whatever turns images into embeddings.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::BoundingBox;
use crate::error::Result;

/// A face found in an image.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceObservation {
    pub bounding_box: BoundingBox,
    pub embedding: Vec<f32>,
}

/// Maps image bytes to zero or more face observations.
///
/// Implementations are CPU-bound and synchronous; async callers go through
/// [`detect_offloaded`]. Undecodable input must fail with
/// `FaceError::UnreadableImage`.
pub trait EmbeddingProvider: Send + Sync {
    fn detect(&self, image: &[u8]) -> Result<Vec<FaceObservation>>;
}

/// Run `provider.detect` on the blocking pool. The bytes are handed back so
/// callers can keep using them.
pub async fn detect_offloaded(
    provider: &Arc<dyn EmbeddingProvider>,
    image: Vec<u8>,
) -> Result<(Vec<u8>, Vec<FaceObservation>)> {
    let provider = Arc::clone(provider);
    let (image, faces) = tokio::task::spawn_blocking(move || {
        let faces = provider.detect(&image);
        (image, faces)
    })
    .await?;
    Ok((image, faces?))
}

/// Which face of a multi-face query image is searched for.
///
/// Queries use exactly one face. Multi-face queries would add a variant here
/// that yields several observations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryFaceSelection {
    /// The first face the provider reported.
    #[default]
    First,
    /// The face with the largest bounding box.
    Largest,
}

impl QueryFaceSelection {
    pub fn select<'a>(&self, faces: &'a [FaceObservation]) -> Option<&'a FaceObservation> {
        match self {
            QueryFaceSelection::First => faces.first(),
            // max_by_key returns the last maximum; reverse so ties keep detection order
            QueryFaceSelection::Largest => faces
                .iter()
                .rev()
                .max_by_key(|face| face.bounding_box.area()),
        }
    }
}
