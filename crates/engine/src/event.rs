//! Lifecycle events a download task publishes, and the progress/task-info
//! snapshots those events carry.

use crate::error::EngineError;
use crate::segment::Segment;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// A download's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

/// `{totalBytes, downloadedBytes, percent, speed, eta}` (spec.md section 3).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub percent: f64,
    pub speed: f64,
    pub eta: f64,
}

impl ProgressSnapshot {
    pub fn zero(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            downloaded_bytes: 0,
            percent: 0.0,
            speed: 0.0,
            eta: 0.0,
        }
    }
}

/// The mapping exposed to observers for one download (spec.md section 3).
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub id: Uuid,
    pub urls: Vec<String>,
    pub filename: String,
    pub output_path: std::path::PathBuf,
    pub total_size: u64,
    pub segments: Vec<Segment>,
    pub status: TaskStatus,
    pub progress: ProgressSnapshot,
    pub error: Option<EngineError>,
    pub start_time: Option<SystemTime>,
    pub end_time: Option<SystemTime>,
}

/// Lifecycle events published by a [`crate::task::DownloadTask`], in the
/// order spec.md section 2/5 describes.
#[derive(Debug, Clone)]
pub enum Event {
    Start { id: Uuid },
    Progress { id: Uuid, progress: ProgressSnapshot },
    SegmentComplete { id: Uuid, segment_index: usize },
    SegmentError { id: Uuid, segment_index: usize, error: EngineError },
    Redirect { id: Uuid, from: String, to: String },
    Pause { id: Uuid },
    Resume { id: Uuid },
    Cancel { id: Uuid },
    Complete { id: Uuid, elapsed: Duration },
    Error { id: Uuid, error: EngineError },
}

impl Event {
    pub fn task_id(&self) -> Uuid {
        match self {
            Event::Start { id }
            | Event::Progress { id, .. }
            | Event::SegmentComplete { id, .. }
            | Event::SegmentError { id, .. }
            | Event::Redirect { id, .. }
            | Event::Pause { id }
            | Event::Resume { id }
            | Event::Cancel { id }
            | Event::Complete { id, .. }
            | Event::Error { id, .. } => *id,
        }
    }
}
