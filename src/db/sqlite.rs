//! SQLite backend implementation.

use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::faces::{bytes_to_embedding, embedding_to_bytes};
use super::schema::SCHEMA;
use super::{
    BoundingBox, ClusteredFace, Face, FaceId, IndexStats, NewFace, NewPhoto, Person, PersonId,
    PersonSlot, Photo, PhotoId, RecordStore,
};
use crate::error::{FaceError, Result};

const PHOTO_COLUMNS: &str =
    "id, content_hash, storage_path, source_path, original_filename, labels, created_at";

const FACE_COLUMNS: &str =
    "id, photo_id, bbox_top, bbox_right, bbox_bottom, bbox_left, embedding, embedding_dim, person_id";

/// Record store backed by a single SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FaceError::io(parent, e))?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::initialize(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| FaceError::StoreUnavailable("connection lock poisoned".to_string()))
    }

    fn query_faces(&self, filter: &str, param: Option<i64>) -> Result<Vec<Face>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {FACE_COLUMNS} FROM faces {filter} ORDER BY id");
        let mut stmt = conn.prepare(&sql)?;
        let faces = match param {
            Some(value) => stmt.query_map([value], face_from_row)?,
            None => stmt.query_map([], face_from_row)?,
        }
        .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(faces)
    }
}

impl RecordStore for SqliteStore {
    // ========================================================================
    // Photo operations
    // ========================================================================

    fn find_photo_by_hash(&self, content_hash: &str) -> Result<Option<Photo>> {
        let conn = self.conn()?;
        let photo = conn
            .query_row(
                &format!("SELECT {PHOTO_COLUMNS} FROM photos WHERE content_hash = ?"),
                [content_hash],
                photo_from_row,
            )
            .optional()?;
        Ok(photo)
    }

    fn get_photo(&self, id: PhotoId) -> Result<Option<Photo>> {
        let conn = self.conn()?;
        let photo = conn
            .query_row(
                &format!("SELECT {PHOTO_COLUMNS} FROM photos WHERE id = ?"),
                [id.0],
                photo_from_row,
            )
            .optional()?;
        Ok(photo)
    }

    fn insert_photo(&self, photo: &NewPhoto) -> Result<Photo> {
        let conn = self.conn()?;
        insert_photo_row(&conn, photo)
    }

    fn insert_photo_with_faces(
        &self,
        photo: &NewPhoto,
        faces: &[ClusteredFace],
    ) -> Result<(Photo, Vec<Face>)> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let stored = insert_photo_row(&tx, photo)?;
        let mut created: HashMap<usize, PersonId> = HashMap::new();
        let mut stored_faces = Vec::with_capacity(faces.len());
        for face in faces {
            let person_id = match face.person {
                PersonSlot::Existing(id) => id,
                PersonSlot::New(slot) => match created.get(&slot) {
                    Some(id) => *id,
                    None => {
                        let id = insert_person_row(&tx)?;
                        created.insert(slot, id);
                        id
                    }
                },
            };
            let new_face = NewFace {
                bounding_box: face.bounding_box,
                embedding: face.embedding.clone(),
                person_id: Some(person_id),
            };
            stored_faces.push(insert_face_row(&tx, stored.id, &new_face)?);
        }

        tx.commit()?;
        Ok((stored, stored_faces))
    }

    fn append_labels(&self, photo_id: PhotoId, labels: &[String]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let current: Option<String> = tx
            .query_row(
                "SELECT labels FROM photos WHERE id = ?",
                [photo_id.0],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.ok_or_else(|| FaceError::NotFound(format!("photo {photo_id}")))?;

        let mut merged = labels_from_json(&current)
            .map_err(|e| FaceError::StoreUnavailable(format!("corrupt labels: {e}")))?;
        let before = merged.len();
        merged.extend(super::normalize_labels(labels));

        if merged.len() != before {
            tx.execute(
                "UPDATE photos SET labels = ? WHERE id = ?",
                params![labels_to_json(&merged)?, photo_id.0],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn all_photos(&self) -> Result<Vec<Photo>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {PHOTO_COLUMNS} FROM photos ORDER BY id"))?;
        let photos = stmt
            .query_map([], photo_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(photos)
    }

    // ========================================================================
    // Face operations
    // ========================================================================

    fn insert_face(&self, photo_id: PhotoId, face: &NewFace) -> Result<Face> {
        let conn = self.conn()?;
        insert_face_row(&conn, photo_id, face)
    }

    fn all_face_embeddings(&self) -> Result<Vec<Face>> {
        self.query_faces("", None)
    }

    fn faces_for_photo(&self, photo_id: PhotoId) -> Result<Vec<Face>> {
        self.query_faces("WHERE photo_id = ?", Some(photo_id.0))
    }

    fn faces_for_person(&self, person_id: PersonId) -> Result<Vec<Face>> {
        self.query_faces("WHERE person_id = ?", Some(person_id.0))
    }

    fn unassigned_faces(&self) -> Result<Vec<Face>> {
        self.query_faces("WHERE person_id IS NULL", None)
    }

    fn set_face_person(&self, face_id: FaceId, person_id: PersonId) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE faces SET person_id = ? WHERE id = ? AND person_id IS NULL",
            params![person_id.0, face_id.0],
        )?;
        Ok(changed == 1)
    }

    // ========================================================================
    // People
    // ========================================================================

    fn create_person(&self) -> Result<PersonId> {
        let conn = self.conn()?;
        insert_person_row(&conn)
    }

    fn people(&self) -> Result<Vec<Person>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT p.id, COUNT(f.id) as face_count
            FROM people p
            LEFT JOIN faces f ON f.person_id = p.id
            GROUP BY p.id
            ORDER BY p.id
            "#,
        )?;

        let people = stmt
            .query_map([], |row| {
                Ok(Person {
                    id: PersonId(row.get(0)?),
                    face_count: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(people)
    }

    fn stats(&self) -> Result<IndexStats> {
        let conn = self.conn()?;
        let stats = conn.query_row(
            r#"
            SELECT
                (SELECT COUNT(*) FROM photos),
                (SELECT COUNT(*) FROM faces),
                (SELECT COUNT(*) FROM people)
            "#,
            [],
            |row| {
                Ok(IndexStats {
                    photos: row.get(0)?,
                    faces: row.get(1)?,
                    people: row.get(2)?,
                })
            },
        )?;
        Ok(stats)
    }
}

// ============================================================================
// Row helpers
// ============================================================================

fn insert_photo_row(conn: &Connection, photo: &NewPhoto) -> Result<Photo> {
    let created_at = Utc::now();
    conn.execute(
        r#"
        INSERT INTO photos (content_hash, storage_path, source_path, original_filename, labels, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
        params![
            photo.content_hash,
            photo.storage_path,
            photo.source_path,
            photo.original_filename,
            labels_to_json(&photo.labels)?,
            created_at,
        ],
    )?;

    Ok(Photo {
        id: PhotoId(conn.last_insert_rowid()),
        content_hash: photo.content_hash.clone(),
        storage_path: photo.storage_path.clone(),
        source_path: photo.source_path.clone(),
        original_filename: photo.original_filename.clone(),
        labels: photo.labels.clone(),
        created_at,
    })
}

fn insert_face_row(conn: &Connection, photo_id: PhotoId, face: &NewFace) -> Result<Face> {
    let bbox = &face.bounding_box;
    conn.execute(
        r#"
        INSERT INTO faces (photo_id, bbox_top, bbox_right, bbox_bottom, bbox_left, embedding, embedding_dim, person_id)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            photo_id.0,
            bbox.top,
            bbox.right,
            bbox.bottom,
            bbox.left,
            embedding_to_bytes(&face.embedding),
            face.embedding.len() as i64,
            face.person_id.map(|p| p.0),
        ],
    )?;

    Ok(Face {
        id: FaceId(conn.last_insert_rowid()),
        photo_id,
        bounding_box: face.bounding_box,
        embedding: face.embedding.clone(),
        person_id: face.person_id,
    })
}

fn insert_person_row(conn: &Connection) -> Result<PersonId> {
    conn.execute("INSERT INTO people DEFAULT VALUES", [])?;
    Ok(PersonId(conn.last_insert_rowid()))
}

fn photo_from_row(row: &Row<'_>) -> rusqlite::Result<Photo> {
    let labels: String = row.get(5)?;
    let labels = labels_from_json(&labels)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;

    Ok(Photo {
        id: PhotoId(row.get(0)?),
        content_hash: row.get(1)?,
        storage_path: row.get(2)?,
        source_path: row.get(3)?,
        original_filename: row.get(4)?,
        labels,
        created_at: row.get(6)?,
    })
}

fn face_from_row(row: &Row<'_>) -> rusqlite::Result<Face> {
    let bytes: Vec<u8> = row.get(6)?;
    let dim: i64 = row.get(7)?;
    let embedding = usize::try_from(dim)
        .ok()
        .and_then(|dim| bytes_to_embedding(&bytes, dim))
        .ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                6,
                Type::Blob,
                format!("embedding of {} bytes does not hold {dim} floats", bytes.len()).into(),
            )
        })?;

    Ok(Face {
        id: FaceId(row.get(0)?),
        photo_id: PhotoId(row.get(1)?),
        bounding_box: BoundingBox {
            top: row.get(2)?,
            right: row.get(3)?,
            bottom: row.get(4)?,
            left: row.get(5)?,
        },
        embedding,
        person_id: row.get::<_, Option<i64>>(8)?.map(PersonId),
    })
}

fn labels_from_json(raw: &str) -> serde_json::Result<BTreeSet<String>> {
    serde_json::from_str(raw)
}

fn labels_to_json(labels: &BTreeSet<String>) -> Result<String> {
    serde_json::to_string(labels).map_err(|e| FaceError::StoreUnavailable(e.to_string()))
}
