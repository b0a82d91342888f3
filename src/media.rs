//! Content-addressed storage for ingested media.
//!
//! Files live under the media root at `uploads/<sha256>.<ext>`. Records only
//! ever hold paths relative to the root; [`MediaStorage::media_url`] turns
//! them into URLs under the configured prefix.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::MediaConfig;
use crate::db::RecordStore;
use crate::error::{FaceError, Result};
use crate::scanner::hashing::content_fingerprint;

const UPLOADS_DIR: &str = "uploads";
const DEFAULT_EXTENSION: &str = "jpg";

#[derive(Debug, Clone)]
pub struct MediaStorage {
    root: PathBuf,
    url_prefix: String,
}

/// Outcome of [`MediaStorage::rehydrate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RehydrationSummary {
    pub restored: usize,
    pub still_missing: usize,
}

impl MediaStorage {
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            root: config.root.clone(),
            url_prefix: config.url_prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative storage path for content with this fingerprint.
    pub fn storage_path_for(content_hash: &str, original_filename: Option<&str>) -> String {
        let extension = original_filename
            .and_then(|name| Path::new(name).extension())
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());
        format!("{UPLOADS_DIR}/{content_hash}.{extension}")
    }

    /// Store `bytes` and return their relative path. Content already on
    /// disk is left untouched.
    pub fn save_bytes(
        &self,
        bytes: &[u8],
        content_hash: &str,
        original_filename: Option<&str>,
    ) -> Result<String> {
        let relative = Self::storage_path_for(content_hash, original_filename);
        if !self.exists(&relative) {
            self.write_file(&relative, bytes)?;
        }
        Ok(relative)
    }

    /// Write an arbitrary artifact under the root, replacing any previous one.
    pub fn write_file(&self, relative: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.resolve_path(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FaceError::io(parent, e))?;
        }

        // write beside the target and rename so readers never see half a file
        let partial = path.with_extension("part");
        std::fs::write(&partial, bytes).map_err(|e| FaceError::io(&partial, e))?;
        std::fs::rename(&partial, &path).map_err(|e| FaceError::io(&path, e))?;
        Ok(path)
    }

    pub fn resolve_path(&self, relative: &str) -> PathBuf {
        self.root.join(relative.trim_start_matches('/'))
    }

    pub fn media_url(&self, relative: &str) -> String {
        format!("{}/{}", self.url_prefix, relative.trim_start_matches('/'))
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.resolve_path(relative).is_file()
    }

    /// Delete a stored file. A file that is already gone is not an error.
    pub fn remove(&self, relative: &str) -> Result<()> {
        let path = self.resolve_path(relative);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FaceError::io(path, e)),
        }
    }

    pub fn read_bytes(&self, relative: &str) -> Result<Vec<u8>> {
        let path = self.resolve_path(relative);
        std::fs::read(&path).map_err(|e| FaceError::io(path, e))
    }

    /// Re-create missing media files from the paths they were ingested from.
    ///
    /// A source whose content no longer matches the recorded fingerprint is
    /// not restored.
    pub fn rehydrate(&self, store: &dyn RecordStore) -> Result<RehydrationSummary> {
        let mut summary = RehydrationSummary::default();

        for photo in store.all_photos()? {
            if self.exists(&photo.storage_path) {
                continue;
            }

            let restored = photo
                .source_path
                .as_deref()
                .map(Path::new)
                .filter(|source| source.is_file())
                .and_then(|source| match std::fs::read(source) {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        warn!(path = %source.display(), error = %e, "Cannot read media source");
                        None
                    }
                })
                .filter(|bytes| content_fingerprint(bytes) == photo.content_hash);

            match restored {
                Some(bytes) => {
                    self.write_file(&photo.storage_path, &bytes)?;
                    summary.restored += 1;
                }
                None => {
                    warn!(photo = %photo.id, path = %photo.storage_path, "Media file missing");
                    summary.still_missing += 1;
                }
            }
        }

        if summary.restored > 0 || summary.still_missing > 0 {
            info!(
                restored = summary.restored,
                still_missing = summary.still_missing,
                "Media rehydration finished"
            );
        }
        Ok(summary)
    }
}
