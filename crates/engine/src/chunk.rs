//! The chunk manager: the segmentation and resume-reconciliation authority.
//! Computes the initial segment layout, reconciles a loaded control record
//! against the current target size, tracks per-segment status and byte
//! counters, mediates all writes through the file writer, and triggers
//! persistence into the control store.

use crate::error::EngineError;
use crate::segment::{split_segments, Segment, SegmentStatus};
use paradl_storage::{Allocation, ControlRecord, ControlStore, FileWriter};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

pub struct ChunkManagerInit {
    pub total_size: u64,
    pub segment_size: u64,
    pub max_splits: u32,
    pub output_path: PathBuf,
    pub file_allocation: Allocation,
    pub resume_downloads: bool,
    pub always_resume: bool,
    pub urls: Vec<String>,
    pub filename: String,
}

pub struct ChunkManager {
    segments: Vec<Segment>,
    writer: Arc<FileWriter>,
    control_store: ControlStore,
    resume_downloads: bool,
    urls: Vec<String>,
    filename: String,
    output_path: PathBuf,
    total_size: u64,
    total_downloaded: u64,
}

impl ChunkManager {
    pub async fn initialize(init: ChunkManagerInit) -> Result<Self, EngineError> {
        let ChunkManagerInit {
            total_size,
            segment_size,
            max_splits,
            output_path,
            file_allocation,
            resume_downloads,
            always_resume,
            urls,
            filename,
        } = init;

        let control_store = ControlStore::new(&output_path);

        // Captured before `open` so a `trunc`/`prealloc`/`falloc` allocation
        // resizing the file can't mask a pre-existing partial download.
        let file_status = FileWriter::exists(&output_path).await?;
        let control_exists = control_store.exists().await;

        let writer = Arc::new(FileWriter::open(&output_path, total_size, file_allocation).await?);

        if resume_downloads && always_resume && file_status.exists && file_status.size > 0 && !control_exists {
            return Err(EngineError::ResumeRequired);
        }

        let record = if resume_downloads {
            control_store.load().await
        } else {
            None
        };

        let (segments, total_downloaded) = if let Some(record) = record {
            if record.segments.is_empty() {
                (split_segments(total_size, segment_size, max_splits), 0)
            } else {
                let span = record.segment_span();
                if span != total_size {
                    if always_resume {
                        return Err(EngineError::ResumeMismatch {
                            expected: total_size,
                            found: span,
                        });
                    }
                    debug!(expected = total_size, found = span, "control record span mismatch, discarding");
                    (split_segments(total_size, segment_size, max_splits), 0)
                } else {
                    reconcile(record)
                }
            }
        } else {
            (split_segments(total_size, segment_size, max_splits), 0)
        };

        let mut manager = Self {
            segments,
            writer,
            control_store,
            resume_downloads,
            urls,
            filename,
            output_path,
            total_size,
            total_downloaded,
        };

        if resume_downloads {
            manager.save_progress().await?;
        }

        Ok(manager)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// A cheap handle to the output file, for segment jobs running outside
    /// this manager's owning task to write their bytes directly.
    pub fn writer(&self) -> Arc<FileWriter> {
        Arc::clone(&self.writer)
    }

    pub fn total_downloaded(&self) -> u64 {
        self.total_downloaded.min(self.total_size)
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn all_complete(&self) -> bool {
        self.segments.iter().all(|s| s.is_complete())
    }

    pub fn any_failed_and_none_in_flight(&self) -> bool {
        let has_failed = self.segments.iter().any(|s| s.status == SegmentStatus::Failed);
        let has_in_flight = self
            .segments
            .iter()
            .any(|s| s.status == SegmentStatus::Downloading || s.status == SegmentStatus::Pending);
        has_failed && !has_in_flight
    }

    /// Returns the first `pending` segment's index, in ascending order.
    pub fn next_pending(&self) -> Option<usize> {
        self.segments.iter().position(|s| s.status == SegmentStatus::Pending)
    }

    pub fn mark_downloading(&mut self, index: usize) {
        self.segments[index].status = SegmentStatus::Downloading;
    }

    pub fn mark_failed(&mut self, index: usize) {
        self.segments[index].status = SegmentStatus::Failed;
    }

    /// Marks a segment complete, brings its counter up to the full segment
    /// size, folds any residual delta into the task total, and persists.
    pub async fn mark_completed(&mut self, index: usize) -> Result<(), EngineError> {
        let full_size = self.segments[index].full_size();
        self.apply_segment_delta(index, full_size);
        self.segments[index].status = SegmentStatus::Completed;
        info!(segment = index, "segment completed");
        self.save_progress().await
    }

    /// Computes the absolute file position for `offset` within segment
    /// `index` and forwards to the file writer. Does not mutate counters.
    pub async fn write_chunk_at(&self, index: usize, offset: u64, bytes: Vec<u8>) -> Result<(), EngineError> {
        let position = self.segments[index].start_byte + offset;
        self.writer.write_at(position, bytes).await?;
        Ok(())
    }

    /// Sets (not adds) `segment.downloaded_bytes` to the cumulative count
    /// for this fetch, and folds the delta against the prior stored value
    /// into the task-wide total. The fetcher reports bytes cumulative
    /// *within this fetch*; callers must pass `initial_downloaded + bytes_this_fetch`.
    pub fn update_segment_progress(&mut self, index: usize, cumulative: u64) {
        self.apply_segment_delta(index, cumulative);
    }

    fn apply_segment_delta(&mut self, index: usize, new_value: u64) {
        let old_value = self.segments[index].downloaded_bytes as i128;
        self.segments[index].downloaded_bytes = new_value;
        let delta = new_value as i128 - old_value;
        self.total_downloaded = (self.total_downloaded as i128 + delta).max(0) as u64;
    }

    /// Writes the current record with a refreshed `lastModified`, if resume
    /// is enabled. `filename` in the record is always just the basename.
    pub async fn save_progress(&mut self) -> Result<(), EngineError> {
        if !self.resume_downloads {
            return Ok(());
        }
        let records = self.segments.iter().map(|s| s.to_record()).collect();
        let mut record = ControlRecord::new(
            self.urls.clone(),
            self.filename.clone(),
            self.output_path.clone(),
            self.total_size,
            records,
        );
        record.touch();
        self.control_store.save(&record).await?;
        Ok(())
    }

    /// Closes the writer; deletes the control file only on success.
    pub async fn cleanup(&mut self, success: bool) -> Result<(), EngineError> {
        self.writer.close().await?;
        if success && self.resume_downloads {
            self.control_store.delete().await?;
        }
        Ok(())
    }
}

/// Adopts a loaded control record's segments with resume normalization:
/// clamp `downloadedBytes` to `[0, fullSize]`, set `status = completed`
/// when fully downloaded else `pending` — any `downloading` state from a
/// prior crashed run becomes `pending`.
fn reconcile(record: ControlRecord) -> (Vec<Segment>, u64) {
    let mut total = 0u64;
    let segments = record
        .segments
        .into_iter()
        .map(|mut rec| {
            let full_size = rec.full_size();
            rec.downloaded_bytes = rec.downloaded_bytes.min(full_size);
            rec.status = if rec.downloaded_bytes == full_size {
                paradl_storage::SegmentStatus::Completed
            } else {
                paradl_storage::SegmentStatus::Pending
            };
            total += rec.downloaded_bytes;
            Segment::from_record(rec)
        })
        .collect();
    (segments, total)
}
