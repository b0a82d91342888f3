//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use crate::config::{Config, MediaConfig};
use crate::db::{BoundingBox, RecordStore, SqliteStore};
use crate::error::{FaceError, Result};
use crate::faces::{EmbeddingProvider, FaceObservation};
use crate::media::MediaStorage;

/// Provider that answers from a table keyed by image bytes.
///
/// Unknown bytes have no faces. Empty bytes and bytes starting with
/// `corrupt` are unreadable.
#[derive(Default)]
pub struct StubProvider {
    faces: HashMap<Vec<u8>, Vec<FaceObservation>>,
}

impl StubProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an image whose faces have these embeddings, in detection order.
    pub fn with(mut self, image: &[u8], embeddings: &[&[f32]]) -> Self {
        let faces = embeddings
            .iter()
            .enumerate()
            .map(|(i, embedding)| observation(i as i32, embedding))
            .collect();
        self.faces.insert(image.to_vec(), faces);
        self
    }

    pub fn into_arc(self) -> Arc<dyn EmbeddingProvider> {
        Arc::new(self)
    }
}

impl EmbeddingProvider for StubProvider {
    fn detect(&self, image: &[u8]) -> Result<Vec<FaceObservation>> {
        if image.is_empty() || image.starts_with(b"corrupt") {
            return Err(FaceError::unreadable("stub cannot decode"));
        }
        Ok(self.faces.get(image).cloned().unwrap_or_default())
    }
}

/// A face at a distinct position for each detection index.
pub fn observation(index: i32, embedding: &[f32]) -> FaceObservation {
    let offset = index * 100;
    FaceObservation {
        bounding_box: BoundingBox::new(offset, offset + 50, offset + 50, offset).unwrap(),
        embedding: embedding.to_vec(),
    }
}

/// Scratch directory, in-memory store and media root for one test.
pub struct Fixture {
    pub dir: TempDir,
    pub store: Arc<dyn RecordStore>,
    pub media: MediaStorage,
    pub config: Config,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.db_path = dir.path().join("facefind.db");
        config.media = MediaConfig {
            root: dir.path().join("media"),
            url_prefix: "/media".to_string(),
        };
        config.detector.models_dir = Some(dir.path().join("models"));

        Self {
            media: MediaStorage::new(&config.media),
            store: Arc::new(SqliteStore::open_in_memory().unwrap()),
            config,
            dir,
        }
    }

    /// Write a file into the scratch directory and return its path.
    pub fn write(&self, relative: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = self.dir.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, bytes).unwrap();
        path
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}
