//! Background scans that report progress over a channel and can be cancelled.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::error::{FaceError, Result};
use crate::scanner::ScanSummary;

/// Unique identifier for a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

impl TaskId {
    pub fn new() -> Self {
        use std::sync::atomic::AtomicU64;
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TaskId(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress information for a task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskProgress {
    pub current: usize,
    pub total: usize,
    pub current_item: Option<String>,
}

impl TaskProgress {
    pub fn new(current: usize, total: usize) -> Self {
        Self {
            current,
            total,
            current_item: None,
        }
    }

    pub fn with_item(mut self, item: impl Into<String>) -> Self {
        self.current_item = Some(item.into());
        self
    }

    /// Progress percentage (0-100).
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            0
        } else {
            ((self.current as f64 / self.total as f64) * 100.0).min(100.0) as u8
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Completed,
    Cancelled,
    Failed(String),
}

/// Update messages sent from background tasks via channels.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskUpdate {
    /// Task has started with total items to process.
    Started { total: usize },
    Progress(TaskProgress),
    Completed { message: String },
    Cancelled,
    Failed { error: String },
}

/// A directory scan running on the runtime.
pub struct ScanTask {
    pub id: TaskId,
    pub root: PathBuf,
    pub state: TaskState,
    pub progress: Option<TaskProgress>,
    cancel_flag: Arc<AtomicBool>,
    receiver: mpsc::Receiver<TaskUpdate>,
    handle: JoinHandle<Result<ScanSummary>>,
    started_at: Instant,
}

impl ScanTask {
    pub fn new(
        root: &Path,
        cancel_flag: Arc<AtomicBool>,
        receiver: mpsc::Receiver<TaskUpdate>,
        handle: JoinHandle<Result<ScanSummary>>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            root: root.to_path_buf(),
            state: TaskState::Running,
            progress: None,
            cancel_flag,
            receiver,
            handle,
            started_at: Instant::now(),
        }
    }

    /// Ask the scan to stop after the file it is working on.
    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel_flag)
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_running(&self) -> bool {
        self.state == TaskState::Running
    }

    /// Drain pending updates, folding them into `state` and `progress`.
    pub fn poll_updates(&mut self) -> Vec<TaskUpdate> {
        // read before draining: everything a finished task sent is already queued
        let finished = self.handle.is_finished();
        let updates: Vec<TaskUpdate> = self.receiver.try_iter().collect();
        for update in &updates {
            match update {
                TaskUpdate::Started { total } => {
                    self.progress = Some(TaskProgress::new(0, *total));
                }
                TaskUpdate::Progress(progress) => {
                    self.progress = Some(progress.clone());
                }
                TaskUpdate::Completed { .. } => self.state = TaskState::Completed,
                TaskUpdate::Cancelled => self.state = TaskState::Cancelled,
                TaskUpdate::Failed { error } => self.state = TaskState::Failed(error.clone()),
            }
        }
        if finished && self.state == TaskState::Running {
            self.state = TaskState::Failed("scan stopped without reporting".to_string());
        }
        updates
    }

    /// Wait for the scan to finish.
    pub async fn join(mut self) -> Result<ScanSummary> {
        let result = (&mut self.handle)
            .await
            .map_err(|e| FaceError::Worker(e.to_string()))
            .and_then(|r| r);
        self.poll_updates();
        result
    }
}
