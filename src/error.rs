//! Error taxonomy for indexing and search.

use std::path::PathBuf;

/// Errors produced by the indexing and search engine.
#[derive(Debug, thiserror::Error)]
pub enum FaceError {
    /// The input media could not be decoded (corrupt, empty or unsupported).
    #[error("unreadable image: {reason}")]
    UnreadableImage { reason: String },

    /// The record store failed; the current operation cannot continue.
    #[error("record store unavailable: {0}")]
    StoreUnavailable(String),

    /// Two embeddings of different length were compared.
    #[error("embedding dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("I/O error on {}: {}", path.display(), source)]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A record referenced by id does not exist.
    #[error("{0} not found")]
    NotFound(String),

    #[error("directory does not exist: {}", .0.display())]
    MissingDirectory(PathBuf),

    /// Face model could not be loaded or inference failed.
    #[error("face model error: {0}")]
    Model(String),

    /// A blocking worker panicked or was cancelled.
    #[error("embedding worker failed: {0}")]
    Worker(String),

    #[error("report error: {0}")]
    Report(String),
}

impl FaceError {
    pub fn unreadable(reason: impl Into<String>) -> Self {
        FaceError::UnreadableImage {
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FaceError::Io {
            path: path.into(),
            source,
        }
    }

    /// Errors that must abort a whole directory scan instead of being
    /// recorded against a single file.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FaceError::StoreUnavailable(_) | FaceError::DimensionMismatch { .. }
        )
    }
}

impl From<rusqlite::Error> for FaceError {
    fn from(err: rusqlite::Error) -> Self {
        FaceError::StoreUnavailable(err.to_string())
    }
}

impl From<tokio::task::JoinError> for FaceError {
    fn from(err: tokio::task::JoinError) -> Self {
        FaceError::Worker(err.to_string())
    }
}

pub type Result<T, E = FaceError> = std::result::Result<T, E>;
