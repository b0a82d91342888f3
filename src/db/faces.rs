//! Face and person records.

use serde::{Deserialize, Serialize};

use super::{PersonId, PhotoId};

/// Face location in pixel coordinates. `top < bottom` and `left < right`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub left: i32,
}

impl BoundingBox {
    /// Build a box, rejecting degenerate or inverted coordinates.
    pub fn new(top: i32, right: i32, bottom: i32, left: i32) -> Option<Self> {
        if top < bottom && left < right {
            Some(Self {
                top,
                right,
                bottom,
                left,
            })
        } else {
            None
        }
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn area(&self) -> i64 {
        self.width() as i64 * self.height() as i64
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let top = self.top.max(other.top);
        let left = self.left.max(other.left);
        let bottom = self.bottom.min(other.bottom);
        let right = self.right.min(other.right);

        let intersection = ((right - left).max(0) as i64 * (bottom - top).max(0) as i64) as f32;
        let union = self.area() as f32 + other.area() as f32 - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// A detected face stored against its photo.
#[derive(Debug, Clone, PartialEq)]
pub struct Face {
    pub id: super::FaceId,
    pub photo_id: PhotoId,
    pub bounding_box: BoundingBox,
    pub embedding: Vec<f32>,
    pub person_id: Option<PersonId>,
}

/// A face about to be written; the id is assigned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFace {
    pub bounding_box: BoundingBox,
    pub embedding: Vec<f32>,
    pub person_id: Option<PersonId>,
}

/// Person given to a face before it is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersonSlot {
    Existing(PersonId),
    /// The n-th person first needed by the same write. Created by the store
    /// in the transaction that writes the face.
    New(usize),
}

/// A face written together with its photo.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusteredFace {
    pub bounding_box: BoundingBox,
    pub embedding: Vec<f32>,
    pub person: PersonSlot,
}

/// A person cluster with its current membership size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Person {
    pub id: PersonId,
    pub face_count: i64,
}

/// Convert f32 slice to little-endian bytes for storage
pub(crate) fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Convert stored bytes back to an f32 vector of length `dim`.
///
/// Returns `None` when the byte count does not match.
pub(crate) fn bytes_to_embedding(bytes: &[u8], dim: usize) -> Option<Vec<f32>> {
    if dim.checked_mul(4) != Some(bytes.len()) {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounding_box_validation() {
        assert!(BoundingBox::new(10, 50, 60, 20).is_some());
        assert!(BoundingBox::new(60, 50, 10, 20).is_none());
        assert!(BoundingBox::new(10, 20, 60, 20).is_none());
    }

    #[test]
    fn test_iou() {
        let a = BoundingBox::new(0, 10, 10, 0).unwrap();
        assert!((a.iou(&a) - 1.0).abs() < 0.001);

        let b = BoundingBox::new(20, 30, 30, 20).unwrap();
        assert!(a.iou(&b).abs() < 0.001);

        let c = BoundingBox::new(0, 15, 10, 5).unwrap();
        assert!((a.iou(&c) - 50.0 / 150.0).abs() < 0.001);
    }

    #[test]
    fn test_embedding_conversion() {
        let original = vec![1.5, -2.3, 0.0, 100.0];
        let bytes = embedding_to_bytes(&original);
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes_to_embedding(&bytes, 4), Some(original));
    }

    #[test]
    fn test_embedding_length_must_match_dimension() {
        let bytes = embedding_to_bytes(&[1.0, 2.0]);
        assert_eq!(bytes_to_embedding(&bytes, 3), None);

        let mut truncated = bytes.clone();
        truncated.push(0xAA);
        assert_eq!(bytes_to_embedding(&truncated, 2), None);
    }
}
