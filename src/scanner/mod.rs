pub mod discovery;
pub mod hashing;

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::{normalize_labels, ClusteredFace, NewPhoto, Photo, RecordStore};
use crate::error::{FaceError, Result};
use crate::faces::{detect_offloaded, ClusterAssigner, EmbeddingProvider, FaceObservation};
use crate::media::MediaStorage;
use crate::tasks::{TaskProgress, TaskUpdate};

pub use discovery::discover_images;
pub use hashing::{content_fingerprint, DedupDecision, DedupGate};

/// Where ingested bytes came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Origin {
    pub source_path: Option<PathBuf>,
    pub original_filename: Option<String>,
}

impl Origin {
    pub fn file(path: &Path) -> Self {
        Self {
            source_path: Some(path.to_path_buf()),
            original_filename: path.file_name().map(|n| n.to_string_lossy().to_string()),
        }
    }

    pub fn upload(filename: impl Into<String>) -> Self {
        Self {
            source_path: None,
            original_filename: Some(filename.into()),
        }
    }
}

/// Result of ingesting one photo.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub photo: Photo,
    pub faces_indexed: usize,
    /// The content was already indexed; `photo` is the existing record.
    pub skipped: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanFailure {
    pub path: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanSummary {
    pub scanned: usize,
    pub indexed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<ScanFailure>,
    pub cancelled: bool,
}

impl fmt::Display for ScanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scanned {}, indexed {}, skipped {}, failed {}",
            self.scanned, self.indexed, self.skipped, self.failed
        )?;
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}

/// Dedup, detect, cluster and store photos.
///
/// Cheap to clone; clones share the store and the commit lock, so any number
/// of clones may ingest concurrently. The commit lock serializes the final
/// duplicate check, person assignment and the write of each photo.
#[derive(Clone)]
pub struct IngestionPipeline {
    store: Arc<dyn RecordStore>,
    provider: Arc<dyn EmbeddingProvider>,
    gate: DedupGate,
    assigner: ClusterAssigner,
    media: MediaStorage,
    extensions: Arc<[String]>,
    commit_lock: Arc<Mutex<()>>,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn RecordStore>,
        provider: Arc<dyn EmbeddingProvider>,
        media: MediaStorage,
        config: &Config,
    ) -> Self {
        Self {
            gate: DedupGate::new(Arc::clone(&store)),
            assigner: ClusterAssigner::new(Arc::clone(&store), &config.matching),
            store,
            provider,
            media,
            extensions: config.dataset.image_extensions.clone().into(),
            commit_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn ingest_file(&self, path: &Path, labels: &[String]) -> Result<IngestOutcome> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| FaceError::io(path, e))?;
        self.ingest_bytes(bytes, Origin::file(path), labels).await
    }

    /// Index one photo. Duplicate content is not re-indexed; its labels are
    /// merged into the existing record instead.
    pub async fn ingest_bytes(
        &self,
        bytes: Vec<u8>,
        origin: Origin,
        labels: &[String],
    ) -> Result<IngestOutcome> {
        if bytes.is_empty() {
            return Err(FaceError::unreadable("empty payload"));
        }
        let labels: Vec<String> = normalize_labels(labels).into_iter().collect();

        let content_hash = content_fingerprint(&bytes);
        if let DedupDecision::Skip { existing } = self.gate.check(content_hash.clone())? {
            return self.skip_duplicate(existing, &labels);
        }

        let (bytes, observations) = detect_offloaded(&self.provider, bytes).await?;

        let pipeline = self.clone();
        tokio::task::spawn_blocking(move || {
            pipeline.commit(&bytes, content_hash, origin, labels, observations)
        })
        .await?
    }

    fn skip_duplicate(&self, existing: Photo, labels: &[String]) -> Result<IngestOutcome> {
        debug!(photo = %existing.id, "Duplicate content, skipping");
        let photo = if labels.is_empty() {
            existing
        } else {
            self.store.append_labels(existing.id, labels)?;
            self.store
                .get_photo(existing.id)?
                .ok_or_else(|| FaceError::NotFound(format!("photo {}", existing.id)))?
        };

        Ok(IngestOutcome {
            photo,
            faces_indexed: 0,
            skipped: true,
        })
    }

    fn commit(
        &self,
        bytes: &[u8],
        content_hash: String,
        origin: Origin,
        labels: Vec<String>,
        observations: Vec<FaceObservation>,
    ) -> Result<IngestOutcome> {
        // the guard protects no data, so a poisoned lock is still usable
        let _guard = self.commit_lock.lock().unwrap_or_else(|p| p.into_inner());

        let content_hash = match self.gate.check(content_hash)? {
            DedupDecision::Skip { existing } => return self.skip_duplicate(existing, &labels),
            DedupDecision::Ingest { content_hash } => content_hash,
        };

        let mut session = self.assigner.begin()?;
        let mut faces = Vec::with_capacity(observations.len());
        for observation in observations {
            let person = session.assign(&observation.embedding)?;
            faces.push(ClusteredFace {
                bounding_box: observation.bounding_box,
                embedding: observation.embedding,
                person,
            });
        }

        let filename = origin.original_filename.as_deref();
        let fresh_media = !self
            .media
            .exists(&MediaStorage::storage_path_for(&content_hash, filename));
        let storage_path = self.media.save_bytes(bytes, &content_hash, filename)?;

        let new_photo = NewPhoto {
            content_hash,
            storage_path,
            source_path: origin
                .source_path
                .map(|p| p.to_string_lossy().to_string()),
            original_filename: origin.original_filename,
            labels: labels.into_iter().collect(),
        };
        let (photo, faces) = match self.store.insert_photo_with_faces(&new_photo, &faces) {
            Ok(stored) => stored,
            Err(e) => {
                // no record refers to the file: the hash was not stored under the lock
                if fresh_media {
                    if let Err(cleanup) = self.media.remove(&new_photo.storage_path) {
                        warn!(path = %new_photo.storage_path, error = %cleanup, "Failed to remove unindexed media");
                    }
                }
                return Err(e);
            }
        };

        info!(photo = %photo.id, faces = faces.len(), "Photo indexed");
        Ok(IngestOutcome {
            photo,
            faces_indexed: faces.len(),
            skipped: false,
        })
    }

    /// Ingest every image under `root`, applying `labels` to each.
    ///
    /// Per-file failures are recorded in the summary and the scan moves on;
    /// store failures and dimension mismatches abort it. `cancel` is checked
    /// between files.
    pub async fn ingest_directory(
        &self,
        root: &Path,
        labels: &[String],
        cancel: Arc<AtomicBool>,
        progress: Option<mpsc::Sender<TaskUpdate>>,
    ) -> Result<ScanSummary> {
        let send = |update: TaskUpdate| {
            if let Some(tx) = &progress {
                let _ = tx.send(update);
            }
        };

        let paths = {
            let root = root.to_path_buf();
            let extensions = Arc::clone(&self.extensions);
            tokio::task::spawn_blocking(move || discover_images(&root, &extensions)).await?
        };
        let paths = match paths {
            Ok(paths) => paths,
            Err(e) => {
                send(TaskUpdate::Failed {
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let total = paths.len();
        info!(root = %root.display(), files = total, "Starting directory scan");
        send(TaskUpdate::Started { total });

        let mut summary = ScanSummary::default();
        for (index, path) in paths.iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                summary.cancelled = true;
                break;
            }

            send(TaskUpdate::Progress(
                TaskProgress::new(index + 1, total).with_item(path.to_string_lossy()),
            ));

            summary.scanned += 1;
            match self.ingest_file(path, labels).await {
                Ok(outcome) if outcome.skipped => summary.skipped += 1,
                Ok(_) => summary.indexed += 1,
                Err(e) if e.is_fatal() => {
                    warn!(path = %path.display(), error = %e, "Scan aborted");
                    send(TaskUpdate::Failed {
                        error: e.to_string(),
                    });
                    return Err(e);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to ingest file");
                    summary.failed += 1;
                    summary.failures.push(ScanFailure {
                        path: path.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(root = %root.display(), %summary, "Directory scan finished");
        if summary.cancelled {
            send(TaskUpdate::Cancelled);
        } else {
            send(TaskUpdate::Completed {
                message: summary.to_string(),
            });
        }
        Ok(summary)
    }

    /// Assign a person to stored faces that have none.
    pub async fn backfill_person_ids(&self) -> Result<usize> {
        let pipeline = self.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = pipeline.commit_lock.lock().unwrap_or_else(|p| p.into_inner());
            pipeline.assigner.backfill_unassigned()
        })
        .await?
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn media(&self) -> &MediaStorage {
        &self.media
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{BoundingBox, NewFace, PersonId, SqliteStore};
    use crate::testing::{Fixture, StubProvider};

    fn pipeline(fixture: &Fixture, provider: StubProvider) -> IngestionPipeline {
        IngestionPipeline::new(
            Arc::clone(&fixture.store),
            provider.into_arc(),
            fixture.media.clone(),
            &fixture.config,
        )
    }

    fn labels(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn people_in(fixture: &Fixture, photo: &Photo) -> Vec<Option<PersonId>> {
        fixture
            .store
            .faces_for_photo(photo.id)
            .unwrap()
            .into_iter()
            .map(|f| f.person_id)
            .collect()
    }

    #[tokio::test]
    async fn test_same_bytes_twice_stored_once() {
        let fixture = Fixture::new();
        let pipeline = pipeline(&fixture, StubProvider::new().with(b"alice", &[&[0.1, 0.2]]));
        let path = fixture.write("alice.jpg", b"alice");

        let first = pipeline.ingest_file(&path, &[]).await.unwrap();
        assert!(!first.skipped);
        assert_eq!(first.faces_indexed, 1);
        assert!(fixture.media.exists(&first.photo.storage_path));
        assert_eq!(first.photo.original_filename.as_deref(), Some("alice.jpg"));

        let second = pipeline.ingest_file(&path, &[]).await.unwrap();
        assert!(second.skipped);
        assert_eq!(second.faces_indexed, 0);
        assert_eq!(second.photo.id, first.photo.id);

        let stats = fixture.store.stats().unwrap();
        assert_eq!((stats.photos, stats.faces, stats.people), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_zero_face_photo_is_stored() {
        let fixture = Fixture::new();
        let pipeline = pipeline(&fixture, StubProvider::new());

        let outcome = pipeline
            .ingest_bytes(b"landscape".to_vec(), Origin::upload("hill.png"), &[])
            .await
            .unwrap();

        assert_eq!(outcome.faces_indexed, 0);
        assert_eq!(outcome.photo.storage_path, format!("uploads/{}.png", content_fingerprint(b"landscape")));
        assert_eq!(fixture.store.stats().unwrap().photos, 1);
    }

    #[tokio::test]
    async fn test_empty_and_corrupt_payloads_are_unreadable() {
        let fixture = Fixture::new();
        let pipeline = pipeline(&fixture, StubProvider::new());

        let err = pipeline.ingest_bytes(Vec::new(), Origin::default(), &[]).await.unwrap_err();
        assert!(matches!(err, FaceError::UnreadableImage { .. }));

        let err = pipeline
            .ingest_bytes(b"corrupt jpeg".to_vec(), Origin::default(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, FaceError::UnreadableImage { .. }));
        assert_eq!(fixture.store.stats().unwrap().photos, 0);
    }

    #[tokio::test]
    async fn test_faces_in_one_photo_see_each_other() {
        let fixture = Fixture::new();
        let pipeline = pipeline(
            &fixture,
            StubProvider::new().with(b"group", &[&[0.0, 0.0], &[0.1, 0.0], &[3.0, 0.0]]),
        );

        let outcome = pipeline
            .ingest_bytes(b"group".to_vec(), Origin::default(), &[])
            .await
            .unwrap();
        assert_eq!(outcome.faces_indexed, 3);

        let people = people_in(&fixture, &outcome.photo);
        assert_eq!(people[0], people[1]);
        assert_ne!(people[0], people[2]);
        assert!(people.iter().all(Option::is_some));
    }

    #[tokio::test]
    async fn test_face_joins_person_from_earlier_photo() {
        let fixture = Fixture::new();
        let pipeline = pipeline(
            &fixture,
            StubProvider::new()
                .with(b"p1", &[&[0.0, 0.0]])
                .with(b"p2", &[&[0.3, 0.0]])
                .with(b"p3", &[&[2.0, 0.0]]),
        );

        let p1 = pipeline.ingest_bytes(b"p1".to_vec(), Origin::default(), &[]).await.unwrap();
        let p2 = pipeline.ingest_bytes(b"p2".to_vec(), Origin::default(), &[]).await.unwrap();
        let p3 = pipeline.ingest_bytes(b"p3".to_vec(), Origin::default(), &[]).await.unwrap();

        assert_eq!(people_in(&fixture, &p1.photo), people_in(&fixture, &p2.photo));
        assert_ne!(people_in(&fixture, &p1.photo), people_in(&fixture, &p3.photo));
    }

    #[tokio::test]
    async fn test_mismatched_faces_in_one_photo_write_nothing() {
        let fixture = Fixture::new();
        let pipeline = pipeline(
            &fixture,
            StubProvider::new().with(b"mixed", &[&[0.0, 0.0], &[0.0, 0.0, 0.0]]),
        );

        let err = pipeline
            .ingest_bytes(b"mixed".to_vec(), Origin::default(), &[])
            .await
            .unwrap_err();

        assert!(matches!(err, FaceError::DimensionMismatch { .. }));
        let stats = fixture.store.stats().unwrap();
        assert_eq!((stats.photos, stats.faces, stats.people), (0, 0, 0));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_people_or_media() {
        let mut fixture = Fixture::new();
        let sqlite = Arc::new(SqliteStore::open_in_memory().unwrap());
        sqlite
            .execute_batch(
                "CREATE TRIGGER no_faces BEFORE INSERT ON faces \
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();
        fixture.store = sqlite as Arc<dyn RecordStore>;
        let pipeline = pipeline(&fixture, StubProvider::new().with(b"alice", &[&[0.1, 0.2]]));

        let err = pipeline
            .ingest_bytes(b"alice".to_vec(), Origin::upload("alice.jpg"), &[])
            .await
            .unwrap_err();

        assert!(matches!(err, FaceError::StoreUnavailable(_)));
        let stats = fixture.store.stats().unwrap();
        assert_eq!((stats.photos, stats.faces, stats.people), (0, 0, 0));
        let path = MediaStorage::storage_path_for(&content_fingerprint(b"alice"), Some("alice.jpg"));
        assert!(!fixture.media.exists(&path));
    }

    #[tokio::test]
    async fn test_duplicate_with_labels_appends_labels() {
        let fixture = Fixture::new();
        let pipeline = pipeline(&fixture, StubProvider::new());

        let first = pipeline
            .ingest_bytes(b"photo".to_vec(), Origin::default(), &labels(&["beach"]))
            .await
            .unwrap();
        let second = pipeline
            .ingest_bytes(b"photo".to_vec(), Origin::default(), &labels(&[" family ", ""]))
            .await
            .unwrap();

        assert!(second.skipped);
        assert_eq!(second.photo.id, first.photo.id);
        let stored: Vec<_> = second.photo.labels.iter().cloned().collect();
        assert_eq!(stored, labels(&["beach", "family"]));
    }

    #[tokio::test]
    async fn test_directory_scan_continues_past_bad_files() {
        let fixture = Fixture::new();
        let pipeline = pipeline(&fixture, StubProvider::new().with(b"alice", &[&[0.1, 0.2]]));

        fixture.write("photos/a.jpg", b"alice");
        fixture.write("photos/b.jpg", b"corrupt data");
        fixture.write("photos/nested/c.png", b"street");
        fixture.write("photos/nested/d.JPG", b"alice");
        fixture.write("photos/notes.txt", b"not an image");

        let (tx, rx) = mpsc::channel();
        let summary = pipeline
            .ingest_directory(
                &fixture.path().join("photos"),
                &labels(&["trip"]),
                Arc::new(AtomicBool::new(false)),
                Some(tx),
            )
            .await
            .unwrap();

        assert_eq!(summary.scanned, 4);
        assert_eq!(summary.indexed, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 1);
        assert!(summary.failures[0].path.ends_with("b.jpg"));
        assert!(!summary.cancelled);

        let updates: Vec<TaskUpdate> = rx.try_iter().collect();
        assert_eq!(updates.first(), Some(&TaskUpdate::Started { total: 4 }));
        assert!(matches!(updates.last(), Some(TaskUpdate::Completed { .. })));

        let photos = fixture.store.all_photos().unwrap();
        assert!(photos.iter().all(|p| p.labels.contains("trip")));
    }

    #[tokio::test]
    async fn test_cancelled_scan_stops_between_files() {
        let fixture = Fixture::new();
        let pipeline = pipeline(&fixture, StubProvider::new());
        fixture.write("photos/a.jpg", b"one");
        fixture.write("photos/b.jpg", b"two");

        let (tx, rx) = mpsc::channel();
        let summary = pipeline
            .ingest_directory(
                &fixture.path().join("photos"),
                &[],
                Arc::new(AtomicBool::new(true)),
                Some(tx),
            )
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.scanned, 0);
        assert_eq!(fixture.store.stats().unwrap().photos, 0);
        assert!(rx.try_iter().any(|u| u == TaskUpdate::Cancelled));
    }

    #[tokio::test]
    async fn test_missing_directory_fails_scan() {
        let fixture = Fixture::new();
        let pipeline = pipeline(&fixture, StubProvider::new());

        let err = pipeline
            .ingest_directory(&fixture.path().join("nope"), &[], Arc::new(AtomicBool::new(false)), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FaceError::MissingDirectory(_)));
    }

    #[tokio::test]
    async fn test_dimension_mismatch_aborts_scan() {
        let fixture = Fixture::new();
        let pipeline = pipeline(
            &fixture,
            StubProvider::new()
                .with(b"two dims", &[&[0.0, 0.0]])
                .with(b"three dims", &[&[0.0, 0.0, 0.0]]),
        );
        fixture.write("photos/a.jpg", b"two dims");
        fixture.write("photos/b.jpg", b"three dims");
        fixture.write("photos/c.jpg", b"no faces");

        let err = pipeline
            .ingest_directory(&fixture.path().join("photos"), &[], Arc::new(AtomicBool::new(false)), None)
            .await
            .unwrap_err();

        assert!(matches!(err, FaceError::DimensionMismatch { .. }));
        assert_eq!(fixture.store.stats().unwrap().photos, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ingestion_creates_one_person() {
        let fixture = Fixture::new();
        let mut provider = StubProvider::new();
        let images: Vec<Vec<u8>> = (0..8).map(|i| format!("same person {i}").into_bytes()).collect();
        for (i, image) in images.iter().enumerate() {
            provider = provider.with(image, &[&[0.01 * i as f32, 0.0]]);
        }
        let pipeline = pipeline(&fixture, provider);

        let handles: Vec<_> = images
            .into_iter()
            .map(|image| {
                let pipeline = pipeline.clone();
                tokio::spawn(async move { pipeline.ingest_bytes(image, Origin::default(), &[]).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stats = fixture.store.stats().unwrap();
        assert_eq!(stats.photos, 8);
        assert_eq!(stats.people, 1);
    }

    #[tokio::test]
    async fn test_backfill_assigns_orphan_faces() {
        let fixture = Fixture::new();
        let pipeline = pipeline(&fixture, StubProvider::new().with(b"alice", &[&[0.0, 0.0]]));
        let indexed = pipeline
            .ingest_bytes(b"alice".to_vec(), Origin::default(), &[])
            .await
            .unwrap();

        // a face written without a person, as older indexes did
        fixture
            .store
            .insert_face(
                indexed.photo.id,
                &NewFace {
                    bounding_box: BoundingBox::new(0, 10, 10, 0).unwrap(),
                    embedding: vec![0.05, 0.0],
                    person_id: None,
                },
            )
            .unwrap();

        assert_eq!(pipeline.backfill_person_ids().await.unwrap(), 1);
        let people = people_in(&fixture, &indexed.photo);
        assert_eq!(people[0], people[1]);
    }
}
