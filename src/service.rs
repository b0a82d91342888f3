//! Composition root: one store handle shared by every component.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use tracing::info;

use crate::config::Config;
use crate::db::{IndexStats, Person, Photo, PhotoId, RecordStore, SqliteStore};
use crate::error::{FaceError, Result};
use crate::faces::{EmbeddingProvider, OnnxFaceProvider};
use crate::media::{MediaStorage, RehydrationSummary};
use crate::scanner::{IngestionPipeline, ScanSummary};
use crate::search::{SearchResponse, SearchService};
use crate::tasks::{ScanTask, TaskId, TaskState};

/// State of the background scan as seen by health checks.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanStatus {
    Idle,
    Running { current: usize, total: usize },
    Finished(TaskState),
}

/// Readiness snapshot. Never waits for ingestion.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub stats: IndexStats,
    pub scan: ScanStatus,
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} photos, {} faces, {} people; scan ",
            self.stats.photos, self.stats.faces, self.stats.people
        )?;
        match &self.scan {
            ScanStatus::Idle => write!(f, "idle"),
            ScanStatus::Running { current, total } => write!(f, "running {current}/{total}"),
            ScanStatus::Finished(TaskState::Running) => write!(f, "running"),
            ScanStatus::Finished(TaskState::Completed) => write!(f, "completed"),
            ScanStatus::Finished(TaskState::Cancelled) => write!(f, "cancelled"),
            ScanStatus::Finished(TaskState::Failed(e)) => write!(f, "failed: {e}"),
        }
    }
}

pub struct FaceFinder {
    config: Config,
    store: Arc<dyn RecordStore>,
    media: MediaStorage,
    pipeline: IngestionPipeline,
    search: SearchService,
    scan: Mutex<Option<ScanTask>>,
}

impl FaceFinder {
    pub fn new(config: Config, store: Arc<dyn RecordStore>, provider: Arc<dyn EmbeddingProvider>) -> Self {
        let media = MediaStorage::new(&config.media);
        let pipeline = IngestionPipeline::new(
            Arc::clone(&store),
            Arc::clone(&provider),
            media.clone(),
            &config,
        );
        let search = SearchService::new(Arc::clone(&store), provider, media.clone(), &config.matching);

        Self {
            config,
            store,
            media,
            pipeline,
            search,
            scan: Mutex::new(None),
        }
    }

    /// Open the SQLite index and the ONNX provider named by `config`.
    pub fn open(config: Config) -> Result<Self> {
        let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::open(&config.db_path)?);
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(OnnxFaceProvider::new(&config.detector));
        info!(db = %config.db_path.display(), "Index opened");
        Ok(Self::new(config, store, provider))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn media(&self) -> &MediaStorage {
        &self.media
    }

    pub fn pipeline(&self) -> &IngestionPipeline {
        &self.pipeline
    }

    pub async fn search(&self, query: Vec<u8>) -> Result<SearchResponse> {
        self.search.search(query).await
    }

    /// Add labels to a stored photo and return the updated record.
    pub fn label(&self, photo_id: PhotoId, labels: &[String]) -> Result<Photo> {
        self.store.append_labels(photo_id, labels)?;
        self.store
            .get_photo(photo_id)?
            .ok_or_else(|| FaceError::NotFound(format!("photo {photo_id}")))
    }

    pub fn people(&self) -> Result<Vec<Person>> {
        self.store.people()
    }

    pub fn stats(&self) -> Result<IndexStats> {
        self.store.stats()
    }

    pub async fn backfill_person_ids(&self) -> Result<usize> {
        self.pipeline.backfill_person_ids().await
    }

    pub async fn rehydrate(&self) -> Result<RehydrationSummary> {
        let media = self.media.clone();
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || media.rehydrate(store.as_ref())).await?
    }

    fn scan_slot(&self) -> MutexGuard<'_, Option<ScanTask>> {
        self.scan.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start scanning `root` in the background. Returns `None` when a scan
    /// is already running.
    pub fn spawn_scan(&self, root: &Path, labels: Vec<String>) -> Option<TaskId> {
        let mut slot = self.scan_slot();
        if let Some(task) = slot.as_mut() {
            task.poll_updates();
            if task.is_running() {
                return None;
            }
        }

        let (tx, rx) = mpsc::channel();
        let cancel = Arc::new(AtomicBool::new(false));
        let pipeline = self.pipeline.clone();
        let scan_root: PathBuf = root.to_path_buf();
        let scan_cancel = Arc::clone(&cancel);
        let handle = tokio::spawn(async move {
            pipeline
                .ingest_directory(&scan_root, &labels, scan_cancel, Some(tx))
                .await
        });

        let task = ScanTask::new(root, cancel, rx, handle);
        let id = task.id;
        info!(root = %root.display(), "Background scan started");
        *slot = Some(task);
        Some(id)
    }

    /// Scan the configured dataset with its labels.
    pub fn spawn_dataset_scan(&self) -> Option<TaskId> {
        let dataset = &self.config.dataset;
        let path = dataset.path.as_ref()?;
        self.spawn_scan(path, dataset.labels.clone())
    }

    /// Start the dataset scan if startup ingestion is enabled.
    pub fn spawn_startup_ingest(&self) -> Option<TaskId> {
        if !self.config.dataset.auto_ingest_on_startup {
            return None;
        }
        self.spawn_dataset_scan()
    }

    /// Ask the background scan to stop after its current file.
    pub fn cancel_scan(&self) -> bool {
        match self.scan_slot().as_ref() {
            Some(task) if task.is_running() => {
                task.cancel();
                true
            }
            _ => false,
        }
    }

    /// Wait for the background scan, if any, to finish.
    pub async fn wait_for_scan(&self) -> Option<Result<ScanSummary>> {
        let task = self.scan_slot().take()?;
        Some(task.join().await)
    }

    pub fn scan_status(&self) -> ScanStatus {
        let mut slot = self.scan_slot();
        let Some(task) = slot.as_mut() else {
            return ScanStatus::Idle;
        };

        task.poll_updates();
        match &task.state {
            TaskState::Running => {
                let (current, total) = task
                    .progress
                    .as_ref()
                    .map(|p| (p.current, p.total))
                    .unwrap_or((0, 0));
                ScanStatus::Running { current, total }
            }
            state => ScanStatus::Finished(state.clone()),
        }
    }

    pub fn health(&self) -> Result<HealthReport> {
        Ok(HealthReport {
            stats: self.store.stats()?,
            scan: self.scan_status(),
        })
    }
}
