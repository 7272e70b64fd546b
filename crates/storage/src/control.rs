//! The control store: persists and loads the JSON sidecar a download's
//! segmentation and per-segment progress live in, so an interrupted download
//! can resume without refetching completed bytes.

use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// The only control-record format this version understands. A sidecar
/// carrying any other value here is treated as absent, never as an error.
pub const CONTROL_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

/// The persisted shape of a segment. Distinct from the engine's own
/// `Segment` type (which carries behavior); this is pure data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub index: usize,
    pub start_byte: u64,
    pub end_byte: u64,
    pub downloaded_bytes: u64,
    pub status: SegmentStatus,
}

impl SegmentRecord {
    pub fn full_size(&self) -> u64 {
        self.end_byte - self.start_byte + 1
    }
}

/// The persisted sidecar document, `"{targetPath}.paradl"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRecord {
    pub version: String,
    pub urls: Vec<String>,
    /// Basename only, never a full path.
    pub filename: String,
    pub output_path: PathBuf,
    pub total_size: u64,
    pub segments: Vec<SegmentRecord>,
    pub created_at: u64,
    pub last_modified: u64,
}

impl ControlRecord {
    pub fn new(
        urls: Vec<String>,
        filename: String,
        output_path: PathBuf,
        total_size: u64,
        segments: Vec<SegmentRecord>,
    ) -> Self {
        let now = now_millis();
        Self {
            version: CONTROL_VERSION.to_string(),
            urls,
            filename,
            output_path,
            total_size,
            segments,
            created_at: now,
            last_modified: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_modified = now_millis();
    }

    /// Sum of the persisted segments' span, used to detect a mismatch
    /// against the current probed `totalSize` on reconciliation.
    pub fn segment_span(&self) -> u64 {
        self.segments.iter().map(|s| s.full_size()).sum()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A thin persistence adapter keyed by the download's target file path.
pub struct ControlStore {
    control_path: PathBuf,
}

impl ControlStore {
    pub fn new(target_path: &Path) -> Self {
        let mut os = target_path.as_os_str().to_owned();
        os.push(".paradl");
        Self {
            control_path: PathBuf::from(os),
        }
    }

    pub fn path(&self) -> &Path {
        &self.control_path
    }

    /// Serializes `record` as pretty JSON and writes it via a sibling temp
    /// file + rename, so a crash never leaves an empty or half-written
    /// sidecar behind.
    pub async fn save(&self, record: &ControlRecord) -> Result<(), StorageError> {
        if let Some(parent) = self.control_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(record)?;
        let tmp_path = {
            let mut p = self.control_path.as_os_str().to_owned();
            p.push(".tmp");
            PathBuf::from(p)
        };
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, &self.control_path).await?;
        debug!(path = %self.control_path.display(), "control record saved");
        Ok(())
    }

    /// Reads and parses the sidecar. Never fails: a missing file, invalid
    /// JSON, or unrecognized version are all treated as "no record".
    pub async fn load(&self) -> Option<ControlRecord> {
        let bytes = tokio::fs::read(&self.control_path).await.ok()?;
        let record: ControlRecord = match serde_json::from_slice(&bytes) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "control record failed to parse, treating as absent");
                return None;
            }
        };
        if record.version != CONTROL_VERSION {
            debug!(version = %record.version, "unrecognized control version, treating as absent");
            return None;
        }
        Some(record)
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.control_path).await.unwrap_or(false)
    }

    /// Removes the sidecar. Absence is not an error; other I/O failures are.
    pub async fn delete(&self) -> Result<(), StorageError> {
        match tokio::fs::remove_file(&self.control_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(output_path: PathBuf) -> ControlRecord {
        ControlRecord::new(
            vec!["https://example.com/file.bin".to_string()],
            "file.bin".to_string(),
            output_path,
            1000,
            vec![SegmentRecord {
                index: 0,
                start_byte: 0,
                end_byte: 999,
                downloaded_bytes: 500,
                status: SegmentStatus::Downloading,
            }],
        )
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("file.bin");
        let store = ControlStore::new(&target);
        let record = sample_record(target.clone());

        store.save(&record).await.unwrap();
        assert!(store.exists().await);

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.total_size, record.total_size);
        assert_eq!(loaded.segments.len(), 1);
        assert_eq!(loaded.segments[0].downloaded_bytes, 500);
    }

    #[tokio::test]
    async fn load_with_wrong_version_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("file.bin");
        let store = ControlStore::new(&target);
        let mut record = sample_record(target.clone());
        record.version = "0.9".to_string();

        store.save(&record).await.unwrap();
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn load_missing_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("file.bin");
        let store = ControlStore::new(&target);
        assert!(store.load().await.is_none());
        assert!(!store.exists().await);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("file.bin");
        let store = ControlStore::new(&target);
        store.delete().await.unwrap();
        store.save(&sample_record(target.clone())).await.unwrap();
        store.delete().await.unwrap();
        assert!(!store.exists().await);
        store.delete().await.unwrap();
    }

    #[test]
    fn control_path_appends_extension() {
        let store = ControlStore::new(Path::new("/tmp/movie.mkv"));
        assert_eq!(store.path(), Path::new("/tmp/movie.mkv.paradl"));
    }
}
