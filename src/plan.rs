use crate::error::{DownloadError, Result};

/// Inclusive byte range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

/// Splits `total_bytes` into `segment_count` contiguous ranges of
/// `total_bytes / segment_count` bytes each; the last range absorbs the
/// remainder and always ends at `total_bytes - 1`.
pub fn plan(total_bytes: u64, segment_count: usize) -> Result<Vec<ByteRange>> {
    if segment_count == 0 || total_bytes < segment_count as u64 {
        return Err(DownloadError::InvalidSize {
            total_bytes,
            segment_count,
        });
    }

    let part_size = total_bytes / segment_count as u64;
    let mut ranges = Vec::with_capacity(segment_count);

    for i in 0..segment_count {
        let start = i as u64 * part_size;
        let end = if i == segment_count - 1 {
            total_bytes - 1
        } else {
            (i as u64 + 1) * part_size - 1
        };
        ranges.push(ByteRange { start, end });
    }

    Ok(ranges)
}
