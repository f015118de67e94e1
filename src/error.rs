use std::time::Duration;

use governor::InsufficientCapacity;
use reqwest::StatusCode;
use thiserror::Error;

use crate::state::{DownloadId, DownloadStatus};

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Could not determine size of {url}: {reason}")]
    SizeUnavailable { url: String, reason: String },
    #[error("Server did not honor range request (status {status})")]
    RangeNotHonored { status: StatusCode },
    #[error("Network request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("No data received for {after:?}")]
    Stalled { after: Duration },
    #[error("Rate limiter cannot admit a piece this large: {0}")]
    RateLimit(#[from] InsufficientCapacity),
    #[error("Stream ended early: expected {expected} bytes, received {received}")]
    IncompleteTransfer { expected: u64, received: u64 },
    #[error("Cannot {operation} download {id} while it is {status}")]
    InvalidState {
        id: DownloadId,
        status: DownloadStatus,
        operation: &'static str,
    },
    #[error("Cannot split {total_bytes} bytes into {segment_count} segments")]
    InvalidSize { total_bytes: u64, segment_count: usize },
    #[error("Download {0} has no segments")]
    NoSegments(DownloadId),
    #[error("Download {0} not found")]
    NotFound(DownloadId),
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl DownloadError {
    /// Stalls count as transport failures for classification purposes.
    pub fn is_transport(&self) -> bool {
        matches!(self, DownloadError::Transport(_) | DownloadError::Stalled { .. })
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("State file I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("State file JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = DownloadError> = std::result::Result<T, E>;
