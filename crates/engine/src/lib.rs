//! Segmentation, scheduling, and download-task orchestration core.
//!
//! This crate has no opinion on where downloads are requested from or how
//! many run at once — that scheduling lives in `paradl-api`. It owns the
//! mechanics of a single download: probing a server, splitting a file into
//! segments, fetching them (one stream or several, possibly across mirrors),
//! and persisting enough state to resume after a restart.

pub mod chunk;
pub mod config;
pub mod error;
pub mod event;
pub mod http;
pub mod limiter;
pub mod progress;
pub mod segment;
pub mod task;

pub use config::{DownloadConfig, DownloadRequest};
pub use error::EngineError;
pub use event::{Event, ProgressSnapshot, TaskInfo, TaskStatus};
pub use paradl_storage::{parse_segment_size, Allocation};
pub use segment::Segment;
pub use task::{derive_filename, DownloadTask};
