pub const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Photos: one row per distinct content hash
CREATE TABLE IF NOT EXISTS photos (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content_hash TEXT NOT NULL UNIQUE,  -- sha256 of the raw bytes
    storage_path TEXT NOT NULL,         -- relative to the media root
    source_path TEXT,                   -- where the bytes were ingested from
    original_filename TEXT,
    labels TEXT NOT NULL DEFAULT '[]',  -- JSON array, sorted
    created_at TEXT NOT NULL
);

-- People: opaque cluster identities, membership lives on faces.person_id
CREATE TABLE IF NOT EXISTS people (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- Faces: detected faces with their embeddings
CREATE TABLE IF NOT EXISTS faces (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    photo_id INTEGER NOT NULL,
    bbox_top INTEGER NOT NULL,
    bbox_right INTEGER NOT NULL,
    bbox_bottom INTEGER NOT NULL,
    bbox_left INTEGER NOT NULL,
    embedding BLOB NOT NULL,            -- float32 array stored as little-endian bytes
    embedding_dim INTEGER NOT NULL,
    person_id INTEGER,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (photo_id) REFERENCES photos(id) ON DELETE CASCADE,
    FOREIGN KEY (person_id) REFERENCES people(id)
);

CREATE INDEX IF NOT EXISTS idx_faces_photo ON faces(photo_id);
CREATE INDEX IF NOT EXISTS idx_faces_person ON faces(person_id);
"#;
