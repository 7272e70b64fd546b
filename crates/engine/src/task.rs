//! The download task: the orchestrator that drives one download from the
//! initial size probe through to completion, failure, or cancellation.
//!
//! A task is split between a thin, cheaply `Clone`-able handle (`DownloadTask`)
//! that external callers use to subscribe, pause, resume, and cancel, and the
//! `run` future that owns the chunk manager outright for its whole lifetime.
//! The chunk manager's segment counters are therefore only ever touched from
//! within `run`'s own loop — concurrent segment jobs report progress back
//! over a channel instead of mutating it directly.

use crate::chunk::{ChunkManager, ChunkManagerInit};
use crate::config::{DownloadConfig, DownloadRequest};
use crate::error::EngineError;
use crate::event::{Event, ProgressSnapshot, TaskInfo, TaskStatus};
use crate::http::{Fetcher, FetcherConfig};
use crate::limiter::SpeedLimiter;
use crate::progress::ProgressTracker;
use crate::segment::Segment;
use futures_util::StreamExt;
use paradl_storage::FileWriter;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::sleep;
use tracing::{error, info, instrument};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Mutable state shared between the running task and external observers
/// (`pause`/`resume`/`cancel`/`info`). Guarded by a plain mutex: every
/// critical section is a handful of field assignments, never an `.await`.
struct TaskState {
    status: TaskStatus,
    progress: ProgressSnapshot,
    segments: Vec<Segment>,
    error: Option<EngineError>,
    start_time: Option<SystemTime>,
    end_time: Option<SystemTime>,
    output_path: PathBuf,
    total_size: u64,
}

/// A single download's handle. Cheaply `Clone`-able via `Arc` internally;
/// the type itself wraps that `Arc` so callers hold one value.
#[derive(Clone)]
pub struct DownloadTask {
    inner: Arc<Inner>,
}

struct Inner {
    id: Uuid,
    request: DownloadRequest,
    config: DownloadConfig,
    events: broadcast::Sender<Event>,
    paused: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    state: Mutex<TaskState>,
}

enum SegmentMsg {
    Progress { index: usize, cumulative: u64 },
    Done { index: usize, result: Result<(), EngineError> },
}

impl DownloadTask {
    pub fn new(request: DownloadRequest, config: DownloadConfig) -> Self {
        let id = Uuid::new_v4();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let state = TaskState {
            status: TaskStatus::Pending,
            progress: ProgressSnapshot::zero(0),
            segments: Vec::new(),
            error: None,
            start_time: None,
            end_time: None,
            output_path: resolve_output_path(&request, &config),
            total_size: 0,
        };
        Self {
            inner: Arc::new(Inner {
                id,
                request,
                config,
                events,
                paused: Arc::new(AtomicBool::new(false)),
                cancelled: Arc::new(AtomicBool::new(false)),
                state: Mutex::new(state),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// A point-in-time snapshot of everything `spec.md` section 3 exposes
    /// about a task.
    pub fn info(&self) -> TaskInfo {
        let state = self.inner.state.lock().unwrap();
        TaskInfo {
            id: self.inner.id,
            urls: self.inner.request.urls.clone(),
            filename: filename_of(&state.output_path),
            output_path: state.output_path.clone(),
            total_size: state.total_size,
            segments: state.segments.clone(),
            status: state.status,
            progress: state.progress,
            error: state.error.clone(),
            start_time: state.start_time,
            end_time: state.end_time,
        }
    }

    /// Legal only while `Downloading`; flips the shared pause flag the run
    /// loop polls between dispatch rounds.
    pub fn pause(&self) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        if state.status != TaskStatus::Downloading {
            return false;
        }
        state.status = TaskStatus::Paused;
        self.inner.paused.store(true, Ordering::Release);
        drop(state);
        let _ = self.inner.events.send(Event::Pause { id: self.inner.id });
        true
    }

    /// Legal only while `Paused`.
    pub fn resume(&self) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        if state.status != TaskStatus::Paused {
            return false;
        }
        state.status = TaskStatus::Downloading;
        self.inner.paused.store(false, Ordering::Release);
        drop(state);
        let _ = self.inner.events.send(Event::Resume { id: self.inner.id });
        true
    }

    /// Legal from any non-terminal state.
    pub fn cancel(&self) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        if matches!(
            state.status,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        ) {
            return false;
        }
        state.status = TaskStatus::Cancelled;
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.paused.store(false, Ordering::Release);
        drop(state);
        let _ = self.inner.events.send(Event::Cancel { id: self.inner.id });
        true
    }

    /// Drives the task to completion. Consumes nothing the handle needs
    /// again; `self` stays usable for observers throughout.
    #[instrument(skip(self), fields(task_id = %self.inner.id))]
    pub async fn run(&self) -> Result<(), EngineError> {
        let start = Instant::now();
        self.set_status(TaskStatus::Downloading);
        {
            let mut state = self.inner.state.lock().unwrap();
            state.start_time = Some(SystemTime::now());
        }

        let result = self.run_inner().await;

        let mut state = self.inner.state.lock().unwrap();
        state.end_time = Some(SystemTime::now());
        match &result {
            Ok(()) => {
                state.status = TaskStatus::Completed;
                drop(state);
                let _ = self.inner.events.send(Event::Complete {
                    id: self.inner.id,
                    elapsed: start.elapsed(),
                });
                info!(elapsed = ?start.elapsed(), "download completed");
            }
            Err(EngineError::Cancelled) => {
                state.status = TaskStatus::Cancelled;
            }
            Err(e) => {
                state.error = Some(e.clone());
                state.status = TaskStatus::Failed;
                drop(state);
                let _ = self.inner.events.send(Event::Error {
                    id: self.inner.id,
                    error: result.clone().unwrap_err(),
                });
                error!(error = %e, "download failed");
            }
        }

        result
    }

    fn set_status(&self, status: TaskStatus) {
        self.inner.state.lock().unwrap().status = status;
    }

    fn emit(&self, event: Event) {
        let _ = self.inner.events.send(event);
    }

    fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    async fn run_inner(&self) -> Result<(), EngineError> {
        if self.inner.request.urls.is_empty() {
            return Err(EngineError::NoUrls);
        }
        if self.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let fetcher = Fetcher::new(FetcherConfig {
            timeout: self.inner.config.timeout,
            retries: self.inner.config.retries,
            retry_delay: self.inner.config.retry_delay,
            headers: self.inner.config.headers.clone(),
        })?;

        let primary_url = &self.inner.request.urls[0];
        let (total_size, redirects) = fetcher.probe_size(primary_url).await?;
        for (from, to) in redirects {
            self.emit(Event::Redirect { id: self.inner.id, from, to });
        }

        let output_path = {
            let mut state = self.inner.state.lock().unwrap();
            state.total_size = total_size;
            state.output_path.clone()
        };

        // Range support decides segmentation up front: a server that can't
        // serve partial content gets a single segment spanning the whole
        // file, so the chunk manager never needs to reconsider its layout.
        let (supports_ranges, range_redirects) = fetcher.probe_range_support(primary_url).await;
        for (from, to) in range_redirects {
            self.emit(Event::Redirect { id: self.inner.id, from, to });
        }
        let max_splits = if supports_ranges { self.inner.config.split } else { 1 };

        let mut chunk_manager = ChunkManager::initialize(ChunkManagerInit {
            total_size,
            segment_size: self.inner.config.segment_size,
            max_splits,
            output_path: output_path.clone(),
            file_allocation: self.inner.config.file_allocation,
            resume_downloads: self.inner.config.resume_downloads,
            always_resume: self.inner.config.always_resume,
            urls: self.inner.request.urls.clone(),
            filename: filename_of(&output_path),
        })
        .await?;

        {
            let mut state = self.inner.state.lock().unwrap();
            state.segments = chunk_manager.segments().to_vec();
        }
        self.emit(Event::Start { id: self.inner.id });

        if chunk_manager.all_complete() {
            chunk_manager.cleanup(true).await?;
            return Ok(());
        }

        let result = if chunk_manager.segments().len() == 1 {
            self.run_single_stream(&fetcher, &mut chunk_manager).await
        } else {
            self.run_segmented(&fetcher, &mut chunk_manager).await
        };

        match result {
            Ok(()) => {
                chunk_manager.cleanup(true).await?;
                Ok(())
            }
            Err(e) => {
                let _ = chunk_manager.cleanup(false).await;
                Err(e)
            }
        }
    }

    async fn run_single_stream(
        &self,
        fetcher: &Fetcher,
        chunk_manager: &mut ChunkManager,
    ) -> Result<(), EngineError> {
        let index = 0;
        let segment = chunk_manager.segments()[index];
        chunk_manager.mark_downloading(index);

        let url = &self.inner.request.urls[0];
        let speed_limiter = SpeedLimiter::new(self.inner.config.max_download_speed);
        let mut tracker = ProgressTracker::new(chunk_manager.total_size());

        let outcome = if segment.start_byte == 0 && segment.downloaded_bytes == 0 {
            fetcher.full_fetch(url, &self.inner.cancelled).await
        } else {
            fetcher
                .ranged_fetch(url, segment.start_byte + segment.downloaded_bytes, segment.end_byte, &self.inner.cancelled)
                .await
        };
        let outcome = match outcome {
            Ok(o) => o,
            Err(e) => {
                chunk_manager.mark_failed(index);
                return Err(e);
            }
        };
        for (from, to) in outcome.redirects {
            self.emit(Event::Redirect { id: self.inner.id, from, to });
        }

        // Pause only prevents *new* segments/fetches from being scheduled;
        // an already in-flight response body is drained to completion
        // regardless of pause state (spec.md section 5). Only cancellation
        // interrupts a stream mid-flight.
        let mut stream = outcome.response.bytes_stream();
        let mut offset = segment.downloaded_bytes;
        while let Some(chunk) = stream.next().await {
            if self.is_cancelled() {
                chunk_manager.mark_failed(index);
                return Err(EngineError::Cancelled);
            }
            let bytes = chunk.map_err(EngineError::from)?;
            if let Some(limiter) = &speed_limiter {
                limiter.throttle(bytes.len()).await;
            }
            chunk_manager.write_chunk_at(index, offset, bytes.to_vec()).await?;
            offset += bytes.len() as u64;
            chunk_manager.update_segment_progress(index, offset);

            let snapshot = tracker.sample(chunk_manager.total_downloaded());
            self.sync_segments(chunk_manager);
            self.set_progress(snapshot);
            if tracker.should_emit(&snapshot, false) {
                self.emit(Event::Progress { id: self.inner.id, progress: snapshot });
            }
        }

        chunk_manager.mark_completed(index).await?;
        self.sync_segments(chunk_manager);
        self.emit(Event::SegmentComplete { id: self.inner.id, segment_index: index });
        let snapshot = tracker.sample(chunk_manager.total_downloaded());
        self.set_progress(snapshot);
        self.emit(Event::Progress { id: self.inner.id, progress: snapshot });
        Ok(())
    }

    async fn run_segmented(
        &self,
        fetcher: &Fetcher,
        chunk_manager: &mut ChunkManager,
    ) -> Result<(), EngineError> {
        let fetcher = Arc::new(fetcher.clone());
        let writer = chunk_manager.writer();
        let semaphore = Arc::new(Semaphore::new(self.inner.config.max_connections_per_server.max(1)));
        let speed_limiter = SpeedLimiter::new(self.inner.config.max_download_speed);
        let (tx, mut rx) = mpsc::unbounded_channel::<SegmentMsg>();
        let mut tracker = ProgressTracker::new(chunk_manager.total_size());
        let mut mirror_index = 0usize;

        let mut last_autosave = Instant::now();
        let autosave_interval = self.inner.config.auto_save_interval;
        let autosave_enabled = self.inner.config.resume_downloads && !autosave_interval.is_zero();

        loop {
            if self.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            self.wait_while_paused().await;
            if self.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            while let Some(index) = chunk_manager.next_pending() {
                let permit = match Arc::clone(&semaphore).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                chunk_manager.mark_downloading(index);
                let segment = chunk_manager.segments()[index];
                let url = self.inner.request.urls[mirror_index % self.inner.request.urls.len()].clone();
                mirror_index += 1;

                let job_fetcher = Arc::clone(&fetcher);
                let job_writer = Arc::clone(&writer);
                let job_cancelled = Arc::clone(&self.inner.cancelled);
                let job_limiter = speed_limiter.clone();
                let job_tx = tx.clone();
                let job_events = self.inner.events.clone();
                let task_id = self.inner.id;

                tokio::spawn(async move {
                    let _permit = permit;
                    let result = run_segment_job(
                        job_fetcher,
                        job_writer,
                        segment,
                        url,
                        job_cancelled,
                        job_limiter,
                        &job_tx,
                        &job_events,
                        task_id,
                    )
                    .await;
                    let _ = job_tx.send(SegmentMsg::Done { index: segment.index, result });
                });
            }

            self.sync_segments(chunk_manager);
            if chunk_manager.all_complete() {
                break;
            }

            let received = tokio::select! {
                msg = rx.recv() => msg,
                _ = sleep(PAUSE_POLL_INTERVAL) => None,
            };

            if let Some(msg) = received {
                match msg {
                    SegmentMsg::Progress { index, cumulative } => {
                        chunk_manager.update_segment_progress(index, cumulative);
                        let snapshot = tracker.sample(chunk_manager.total_downloaded());
                        self.sync_segments(chunk_manager);
                        self.set_progress(snapshot);
                        if tracker.should_emit(&snapshot, false) {
                            self.emit(Event::Progress { id: self.inner.id, progress: snapshot });
                        }
                    }
                    SegmentMsg::Done { index, result } => match result {
                        Ok(()) => {
                            chunk_manager.mark_completed(index).await?;
                            self.sync_segments(chunk_manager);
                            self.emit(Event::SegmentComplete { id: self.inner.id, segment_index: index });
                            let snapshot = tracker.sample(chunk_manager.total_downloaded());
                            self.set_progress(snapshot);
                            tracker.should_emit(&snapshot, true);
                            self.emit(Event::Progress { id: self.inner.id, progress: snapshot });
                        }
                        Err(EngineError::Cancelled) => {}
                        Err(e) => {
                            chunk_manager.mark_failed(index);
                            self.sync_segments(chunk_manager);
                            self.emit(Event::SegmentError {
                                id: self.inner.id,
                                segment_index: index,
                                error: e,
                            });
                        }
                    },
                }
            }

            if autosave_enabled && last_autosave.elapsed() >= autosave_interval {
                chunk_manager.save_progress().await?;
                last_autosave = Instant::now();
            }

            if chunk_manager.any_failed_and_none_in_flight() {
                return Err(EngineError::AllSegmentsFailed);
            }
        }

        // The loop only breaks once the final segment's `Done` message has
        // already forced a terminal `Progress` emission above, so there is
        // nothing left to sample here.
        Ok(())
    }

    async fn wait_while_paused(&self) {
        while self.inner.paused.load(Ordering::Acquire) && !self.is_cancelled() {
            sleep(PAUSE_POLL_INTERVAL).await;
        }
    }

    fn sync_segments(&self, chunk_manager: &ChunkManager) {
        let mut state = self.inner.state.lock().unwrap();
        state.segments = chunk_manager.segments().to_vec();
    }

    fn set_progress(&self, snapshot: ProgressSnapshot) {
        self.inner.state.lock().unwrap().progress = snapshot;
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_segment_job(
    fetcher: Arc<Fetcher>,
    writer: Arc<FileWriter>,
    segment: Segment,
    url: String,
    cancelled: Arc<AtomicBool>,
    speed_limiter: Option<SpeedLimiter>,
    tx: &mpsc::UnboundedSender<SegmentMsg>,
    events: &broadcast::Sender<Event>,
    task_id: Uuid,
) -> Result<(), EngineError> {
    let start = segment.start_byte + segment.downloaded_bytes;
    let outcome = fetcher.ranged_fetch(&url, start, segment.end_byte, &cancelled).await?;
    for (from, to) in outcome.redirects {
        let _ = events.send(Event::Redirect { id: task_id, from, to });
    }

    let mut stream = outcome.response.bytes_stream();
    let mut bytes_this_fetch = 0u64;
    while let Some(chunk) = stream.next().await {
        if cancelled.load(Ordering::Acquire) {
            return Err(EngineError::Cancelled);
        }
        let bytes = chunk.map_err(EngineError::from)?;
        if let Some(limiter) = &speed_limiter {
            limiter.throttle(bytes.len()).await;
        }
        let position = segment.downloaded_bytes + bytes_this_fetch;
        writer
            .write_at(segment.start_byte + position, bytes.to_vec())
            .await
            .map_err(EngineError::from)?;
        bytes_this_fetch += bytes.len() as u64;
        let cumulative = segment.downloaded_bytes + bytes_this_fetch;
        let _ = tx.send(SegmentMsg::Progress { index: segment.index, cumulative });
    }
    Ok(())
}

fn resolve_output_path(request: &DownloadRequest, config: &DownloadConfig) -> PathBuf {
    let dir = request
        .output_directory
        .clone()
        .or_else(|| config.output_directory.clone())
        .unwrap_or_else(|| PathBuf::from("."));
    let filename = request
        .filename
        .clone()
        .unwrap_or_else(|| derive_filename(&request.urls.first().cloned().unwrap_or_default()));
    dir.join(filename)
}

fn filename_of(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string())
}

/// Derives a filename from the last non-empty path segment of `url`,
/// percent-decoded, falling back to `"download"` when the URL has none.
/// Exposed publicly so callers (the CLI's output-path resolution) can use
/// the same default a task would pick when no explicit filename is given.
pub fn derive_filename(url: &str) -> String {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return "download".to_string();
    };
    let last_segment = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty());
    match last_segment {
        Some(segment) => percent_decode(segment),
        None => "download".to_string(),
    }
}

/// Minimal percent-decoder for URL path segments; no external crate in the
/// workspace's dependency set exposes this narrowly, so it is inlined here.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&input[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).unwrap_or_else(|_| input.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_filename_takes_last_path_segment() {
        assert_eq!(derive_filename("https://example.com/a/b/file.zip"), "file.zip");
    }

    #[test]
    fn derive_filename_decodes_percent_escapes() {
        assert_eq!(derive_filename("https://example.com/my%20file.txt"), "my file.txt");
    }

    #[test]
    fn derive_filename_falls_back_without_a_path() {
        assert_eq!(derive_filename("https://example.com"), "download");
        assert_eq!(derive_filename("not a url"), "download");
    }

    #[test]
    fn pause_resume_cancel_enforce_legal_transitions() {
        let task = DownloadTask::new(
            DownloadRequest {
                urls: vec!["https://example.com/f".to_string()],
                filename: None,
                output_directory: None,
            },
            DownloadConfig::default(),
        );
        // Not yet downloading: pause is illegal.
        assert!(!task.pause());
        task.set_status(TaskStatus::Downloading);
        assert!(task.pause());
        assert!(!task.pause());
        assert!(task.resume());
        assert!(!task.resume());
        assert!(task.cancel());
        assert!(!task.cancel());
    }
}
