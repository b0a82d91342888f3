mod schema;
pub mod faces;
pub mod sqlite;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

use crate::error::Result;

pub use faces::{BoundingBox, ClusteredFace, Face, NewFace, Person, PersonSlot};
pub use sqlite::SqliteStore;

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

record_id!(
    /// Identifier of a stored photo.
    PhotoId
);
record_id!(
    /// Identifier of a stored face.
    FaceId
);
record_id!(
    /// Opaque person-cluster identity.
    PersonId
);

/// An indexed photo. Only `labels` ever changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Photo {
    pub id: PhotoId,
    pub content_hash: String,
    /// Path relative to the media root.
    pub storage_path: String,
    pub source_path: Option<String>,
    pub original_filename: Option<String>,
    pub labels: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

/// A photo about to be written; id and timestamp are assigned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPhoto {
    pub content_hash: String,
    pub storage_path: String,
    pub source_path: Option<String>,
    pub original_filename: Option<String>,
    pub labels: BTreeSet<String>,
}

/// Row counts, used for health reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub photos: i64,
    pub faces: i64,
    pub people: i64,
}

/// Persistence for photos, faces and people.
///
/// Implementations are shared by every component of the index, so all
/// methods take `&self` and must be safe to call from several threads.
/// Any infrastructure failure is reported as `FaceError::StoreUnavailable`.
pub trait RecordStore: Send + Sync {
    // === Photos ===

    fn find_photo_by_hash(&self, content_hash: &str) -> Result<Option<Photo>>;

    fn get_photo(&self, id: PhotoId) -> Result<Option<Photo>>;

    fn insert_photo(&self, photo: &NewPhoto) -> Result<Photo>;

    /// Write a photo together with its faces in one transaction. People for
    /// `PersonSlot::New` faces are created in the same transaction, one per
    /// distinct slot; on failure nothing is written.
    fn insert_photo_with_faces(
        &self,
        photo: &NewPhoto,
        faces: &[ClusteredFace],
    ) -> Result<(Photo, Vec<Face>)>;

    /// Add labels to a photo; existing labels are kept.
    fn append_labels(&self, photo_id: PhotoId, labels: &[String]) -> Result<()>;

    fn all_photos(&self) -> Result<Vec<Photo>>;

    // === Faces ===

    fn insert_face(&self, photo_id: PhotoId, face: &NewFace) -> Result<Face>;

    /// Every stored face, in insertion order.
    fn all_face_embeddings(&self) -> Result<Vec<Face>>;

    fn faces_for_photo(&self, photo_id: PhotoId) -> Result<Vec<Face>>;

    fn faces_for_person(&self, person_id: PersonId) -> Result<Vec<Face>>;

    /// Faces stored without a person, oldest first.
    fn unassigned_faces(&self) -> Result<Vec<Face>>;

    /// Set the person of a face that has none yet. Returns false when the
    /// face already belonged to a person.
    fn set_face_person(&self, face_id: FaceId, person_id: PersonId) -> Result<bool>;

    // === People ===

    fn create_person(&self) -> Result<PersonId>;

    fn people(&self) -> Result<Vec<Person>>;

    fn stats(&self) -> Result<IndexStats>;
}

/// Trim, drop empties and deduplicate a list of labels.
pub fn normalize_labels<I, S>(labels: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    labels
        .into_iter()
        .map(|label| label.as_ref().trim().to_string())
        .filter(|label| !label.is_empty())
        .collect()
}

/// Split a comma-separated label list.
pub fn parse_labels(raw: &str) -> Vec<String> {
    normalize_labels(raw.split(',')).into_iter().collect()
}
