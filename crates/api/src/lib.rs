//! Multi-task downloader facade sitting on top of `paradl-engine`: a bounded
//! scheduler, a registry of active tasks, and event fan-out so a consumer
//! can attach one listener instead of one per task.

pub mod downloader;

pub use downloader::{DownloadHandle, Downloader};
pub use paradl_engine::{
    derive_filename, parse_segment_size, Allocation, DownloadConfig, DownloadRequest, EngineError,
    Event, TaskInfo, TaskStatus,
};
