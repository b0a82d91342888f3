//! Content fingerprints and the duplicate gate in front of ingestion.

use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::db::{Photo, RecordStore};
use crate::error::Result;

/// Lowercase hex SHA-256 of the raw bytes.
pub fn content_fingerprint(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[derive(Debug, Clone, PartialEq)]
pub enum DedupDecision {
    /// Not seen before; index it under this fingerprint.
    Ingest { content_hash: String },
    /// Already indexed.
    Skip { existing: Photo },
}

impl DedupDecision {
    pub fn is_skip(&self) -> bool {
        matches!(self, DedupDecision::Skip { .. })
    }
}

/// Decides whether bytes are new content.
#[derive(Clone)]
pub struct DedupGate {
    store: Arc<dyn RecordStore>,
}

impl DedupGate {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub fn should_ingest(&self, bytes: &[u8]) -> Result<DedupDecision> {
        self.check(content_fingerprint(bytes))
    }

    pub fn check(&self, content_hash: String) -> Result<DedupDecision> {
        Ok(match self.store.find_photo_by_hash(&content_hash)? {
            Some(existing) => DedupDecision::Skip { existing },
            None => DedupDecision::Ingest { content_hash },
        })
    }
}
