//! The file writer: owns a single random-access output file handle and
//! performs positional writes. It knows nothing about segments — all
//! coordination is the chunk manager's responsibility.

use crate::error::StorageError;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

const PREALLOC_BUF_SIZE: usize = 1_048_576;

/// The strategy used to reserve file space at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Allocation {
    /// No pre-sizing.
    #[default]
    None,
    /// Set the file length to `size` (sparse).
    Trunc,
    /// Set length to `size`, then write zeros over the whole range in 1 MiB
    /// buffers, forcing block allocation on filesystems that support it.
    Prealloc,
    /// Request a real allocated region via `posix_fallocate`; falls back to
    /// `Trunc` when unavailable.
    Falloc,
}

/// Result of probing an external path.
#[derive(Debug, Clone, Copy)]
pub struct FileStatus {
    pub exists: bool,
    pub size: u64,
}

/// Owns a single output file handle for the duration of one download.
pub struct FileWriter {
    file: Arc<std::fs::File>,
    closed: AtomicBool,
}

impl FileWriter {
    /// Ensures the directory exists, opens the file read-write (creating it
    /// if absent, without truncating an existing one — resume safety), and
    /// applies the requested allocation strategy.
    pub async fn open(path: &Path, size: u64, allocation: Allocation) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let path_buf = path.to_path_buf();
        let std_file = tokio::task::spawn_blocking(move || {
            std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path_buf)
        })
        .await
        .expect("open blocking task panicked")?;

        let file = Arc::new(std_file);
        apply_allocation(Arc::clone(&file), size, allocation).await?;

        Ok(Self {
            file,
            closed: AtomicBool::new(false),
        })
    }

    /// Positional write at an absolute byte offset. Does not advance any
    /// shared file cursor, so concurrent writers targeting disjoint ranges
    /// never interfere with each other.
    pub async fn write_at(&self, position: u64, bytes: Vec<u8>) -> Result<(), StorageError> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || write_at_impl(&file, position, &bytes))
            .await
            .expect("write_at blocking task panicked")?;
        Ok(())
    }

    /// Flushes and releases the handle. A second call is a no-op.
    pub async fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || file.sync_all())
            .await
            .expect("close blocking task panicked")?;
        debug!("file writer closed");
        Ok(())
    }

    /// Returns `{exists, size}` for an external path.
    pub async fn exists(path: &Path) -> Result<FileStatus, StorageError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(FileStatus {
                exists: true,
                size: meta.len(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileStatus {
                exists: false,
                size: 0,
            }),
            Err(e) => Err(e.into()),
        }
    }
}

async fn apply_allocation(
    file: Arc<std::fs::File>,
    size: u64,
    allocation: Allocation,
) -> Result<(), StorageError> {
    match allocation {
        Allocation::None => Ok(()),
        Allocation::Trunc => {
            tokio::task::spawn_blocking(move || file.set_len(size))
                .await
                .expect("set_len blocking task panicked")?;
            Ok(())
        }
        Allocation::Prealloc => {
            tokio::task::spawn_blocking(move || prealloc_impl(&file, size))
                .await
                .expect("prealloc blocking task panicked")?;
            Ok(())
        }
        Allocation::Falloc => {
            let fallback = tokio::task::spawn_blocking(move || match paradl_platform::fallocate(&file, size) {
                Ok(()) => None,
                Err(e) => {
                    warn!(error = %e, "fallocate unavailable, falling back to trunc");
                    Some(file)
                }
            })
            .await
            .expect("fallocate blocking task panicked");

            if let Some(file) = fallback {
                tokio::task::spawn_blocking(move || file.set_len(size))
                    .await
                    .expect("set_len blocking task panicked")?;
            }
            Ok(())
        }
    }
}

fn prealloc_impl(file: &std::fs::File, size: u64) -> std::io::Result<()> {
    file.set_len(size)?;
    let zeros = vec![0u8; PREALLOC_BUF_SIZE];
    let mut written = 0u64;
    while written < size {
        let remaining = size - written;
        let chunk_len = remaining.min(PREALLOC_BUF_SIZE as u64) as usize;
        write_at_impl(file, written, &zeros[..chunk_len])?;
        written += chunk_len as u64;
    }
    Ok(())
}

#[cfg(unix)]
fn write_at_impl(file: &std::fs::File, position: u64, bytes: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(bytes, position)
}

#[cfg(windows)]
fn write_at_impl(file: &std::fs::File, position: u64, bytes: &[u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut pos = position;
    let mut buf = bytes;
    while !buf.is_empty() {
        let written = file.seek_write(buf, pos)?;
        if written == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "seek_write wrote 0 bytes",
            ));
        }
        buf = &buf[written..];
        pos += written as u64;
    }
    Ok(())
}

/// Parses a human segment-size string such as `"20MB"` into a byte count.
/// Units are case-insensitive: `B`, `KB`, `MB`, `GB`. Malformed strings fail.
pub fn parse_segment_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let upper = s.to_ascii_uppercase();
    let (digits, unit, multiplier) = if let Some(d) = upper.strip_suffix("GB") {
        (d, "GB", 1024u64 * 1024 * 1024)
    } else if let Some(d) = upper.strip_suffix("MB") {
        (d, "MB", 1024 * 1024)
    } else if let Some(d) = upper.strip_suffix("KB") {
        (d, "KB", 1024)
    } else if let Some(d) = upper.strip_suffix('B') {
        (d, "B", 1)
    } else {
        (upper.as_str(), "", 1)
    };
    let _ = unit;
    let digits = digits.trim();
    if digits.is_empty() {
        return Err(format!("malformed segment size: {s:?}"));
    }
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("malformed segment size: {s:?}"))?;
    Ok(value * multiplier)
}

/// Convenience wrapper matching [`FileWriter::exists`] without requiring a
/// constructed writer, used by the chunk manager when probing before it
/// has decided whether to open the file at all.
pub async fn probe(path: &Path) -> Result<FileStatus, StorageError> {
    FileWriter::exists(path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_creates_file_and_writes_at_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let writer = FileWriter::open(&path, 10, Allocation::None).await.unwrap();

        writer.write_at(5, vec![1, 2, 3]).await.unwrap();
        writer.write_at(0, vec![9, 9]).await.unwrap();
        writer.close().await.unwrap();
        writer.close().await.unwrap(); // idempotent

        let data = tokio::fs::read(&path).await.unwrap();
        assert_eq!(&data[0..2], &[9, 9]);
        assert_eq!(&data[5..8], &[1, 2, 3]);
    }

    #[tokio::test]
    async fn trunc_allocation_sets_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let _writer = FileWriter::open(&path, 4096, Allocation::Trunc).await.unwrap();
        let meta = tokio::fs::metadata(&path).await.unwrap();
        assert_eq!(meta.len(), 4096);
    }

    #[tokio::test]
    async fn prealloc_allocation_zero_fills() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let _writer = FileWriter::open(&path, 2_000_000, Allocation::Prealloc)
            .await
            .unwrap();
        let data = tokio::fs::read(&path).await.unwrap();
        assert_eq!(data.len(), 2_000_000);
        assert!(data.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn resume_open_does_not_truncate_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        tokio::fs::write(&path, vec![7u8; 100]).await.unwrap();

        let _writer = FileWriter::open(&path, 100, Allocation::None).await.unwrap();
        let data = tokio::fs::read(&path).await.unwrap();
        assert_eq!(data, vec![7u8; 100]);
    }

    #[tokio::test]
    async fn exists_reports_absent_and_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let status = FileWriter::exists(&path).await.unwrap();
        assert!(!status.exists);

        tokio::fs::write(&path, b"hello").await.unwrap();
        let status = FileWriter::exists(&path).await.unwrap();
        assert!(status.exists);
        assert_eq!(status.size, 5);
    }

    #[test]
    fn parse_segment_size_handles_units_case_insensitively() {
        assert_eq!(parse_segment_size("20MB").unwrap(), 20 * 1024 * 1024);
        assert_eq!(parse_segment_size("20mb").unwrap(), 20 * 1024 * 1024);
        assert_eq!(parse_segment_size("1GB").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_segment_size("512KB").unwrap(), 512 * 1024);
        assert_eq!(parse_segment_size("100B").unwrap(), 100);
        assert_eq!(parse_segment_size("100").unwrap(), 100);
    }

    #[test]
    fn parse_segment_size_rejects_malformed_input() {
        assert!(parse_segment_size("").is_err());
        assert!(parse_segment_size("MB").is_err());
        assert!(parse_segment_size("20XB").is_err());
        assert!(parse_segment_size("abc").is_err());
    }
}
