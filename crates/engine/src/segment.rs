//! Segment geometry: fresh segmentation and the in-memory segment type the
//! chunk manager tracks per download.

pub use paradl_storage::SegmentStatus;
use paradl_storage::SegmentRecord;

/// A contiguous, inclusive byte range of the target file, tracked for the
/// lifetime of one download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub start_byte: u64,
    pub end_byte: u64,
    pub downloaded_bytes: u64,
    pub status: SegmentStatus,
}

impl Segment {
    pub fn full_size(&self) -> u64 {
        self.end_byte - self.start_byte + 1
    }

    pub fn remaining(&self) -> u64 {
        self.full_size() - self.downloaded_bytes
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.status, SegmentStatus::Completed)
    }

    pub fn to_record(self) -> SegmentRecord {
        SegmentRecord {
            index: self.index,
            start_byte: self.start_byte,
            end_byte: self.end_byte,
            downloaded_bytes: self.downloaded_bytes,
            status: self.status,
        }
    }

    pub fn from_record(record: SegmentRecord) -> Self {
        Self {
            index: record.index,
            start_byte: record.start_byte,
            end_byte: record.end_byte,
            downloaded_bytes: record.downloaded_bytes,
            status: record.status,
        }
    }
}

/// Builds a fresh segmentation for `total_size` bytes.
///
/// `max_segments_by_size = max(1, ceil(total_size / segment_size))`;
/// `target_segments = max(1, min(max_splits, max_segments_by_size))`;
/// segments get a nominal width of `ceil(total_size / target_segments)`,
/// with the final segment clamped to `total_size - 1`.
///
/// `max_segments_by_size` uses ceiling division: `segment_size` is a
/// *minimum* target, and the worked clean-download example (15,360 bytes,
/// `segmentSize=4096` → 4 segments, not 3) only holds under ceiling
/// division, so that is the reading this implementation follows.
pub fn split_segments(total_size: u64, segment_size: u64, max_splits: u32) -> Vec<Segment> {
    debug_assert!(total_size > 0);
    let segment_size = segment_size.max(1);
    let max_segments_by_size = total_size.div_ceil(segment_size).max(1);
    let target_segments = max_splits.max(1).min(max_segments_by_size.min(u32::MAX as u64) as u32);
    let target_segments = target_segments.max(1) as u64;

    let width = total_size.div_ceil(target_segments);

    let mut segments = Vec::new();
    let mut start = 0u64;
    let mut index = 0usize;
    while start < total_size {
        let end = (start + width - 1).min(total_size - 1);
        segments.push(Segment {
            index,
            start_byte: start,
            end_byte: end,
            downloaded_bytes: 0,
            status: SegmentStatus::Pending,
        });
        start = end + 1;
        index += 1;
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_byte_file_produces_one_segment() {
        let segments = split_segments(1, 4096, 8);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start_byte, 0);
        assert_eq!(segments[0].end_byte, 0);
    }

    #[test]
    fn split_is_capped_by_max_segments_by_size() {
        // exact divisor: 12,000 / 4,000 = 3, so split=10 is capped to 3.
        let segments = split_segments(12_000, 4_000, 10);
        assert_eq!(segments.len(), 3);
    }

    #[test]
    fn never_exceeds_split_even_when_size_allows_more() {
        let segments = split_segments(1_000_000, 1, 4);
        assert_eq!(segments.len(), 4);
    }

    #[test]
    fn segment_sizes_differ_by_at_most_one_byte() {
        let segments = split_segments(1_000_003, 1, 7);
        let sizes: Vec<u64> = segments.iter().map(|s| s.full_size()).collect();
        let min = *sizes.iter().min().unwrap();
        let max = *sizes.iter().max().unwrap();
        assert!(max - min <= 1);
    }

    #[test]
    fn segments_partition_the_whole_file() {
        let segments = split_segments(15_360, 4_096, 5);
        assert_eq!(segments[0].start_byte, 0);
        assert_eq!(segments.last().unwrap().end_byte, 15_359);
        for w in segments.windows(2) {
            assert_eq!(w[0].end_byte + 1, w[1].start_byte);
        }
    }

    #[test]
    fn split_above_max_by_size_is_clamped_to_max_by_size() {
        // max_segments_by_size = ceil(10_000 / 4_000) = 3; split=100 must
        // not exceed it.
        let segments = split_segments(10_000, 4_000, 100);
        assert_eq!(segments.len(), 3);
    }

    #[test]
    fn clean_download_scenario_four_segments() {
        // spec.md scenario 1: 15,360 bytes, split=5, segmentSize=4096.
        let segments = split_segments(15_360, 4_096, 5);
        assert_eq!(segments.len(), 4);
    }
}
