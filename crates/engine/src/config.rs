//! The configuration surface a download is started with (spec.md section 3).

use paradl_storage::Allocation;
use reqwest::header::HeaderMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Upper bound on the number of segments per download.
    pub split: u32,
    /// Minimum target size per segment, in bytes.
    pub segment_size: u64,
    /// Cap on simultaneous in-flight segments for one task.
    pub max_connections_per_server: usize,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Per-request retry attempts for HEAD and GET.
    pub retries: u32,
    /// Base delay between retries.
    pub retry_delay: Duration,
    /// Fixed headers applied to every request.
    pub headers: HeaderMap,
    /// File allocation strategy to use when opening the output file.
    pub file_allocation: Allocation,
    /// Enables sidecar persistence and load.
    pub resume_downloads: bool,
    /// Seconds between periodic control saves (0 disables auto-save).
    pub auto_save_interval: Duration,
    /// When true and an existing target file is present but no valid
    /// control record, fail instead of restarting.
    pub always_resume: bool,
    /// Default output directory when a download omits one.
    pub output_directory: Option<PathBuf>,
    /// Token-bucket cap in bytes/sec; `0` disables limiting.
    pub max_download_speed: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            split: 8,
            segment_size: 1_048_576,
            max_connections_per_server: 4,
            timeout: Duration::from_secs(30),
            retries: 3,
            retry_delay: Duration::from_millis(1000),
            headers: HeaderMap::new(),
            file_allocation: Allocation::None,
            resume_downloads: true,
            auto_save_interval: Duration::from_secs(5),
            always_resume: false,
            output_directory: None,
            max_download_speed: 0,
        }
    }
}

/// Per-download parameters layered on top of [`DownloadConfig`].
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub urls: Vec<String>,
    pub filename: Option<String>,
    pub output_directory: Option<PathBuf>,
}
