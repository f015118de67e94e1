use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct DownloadId(Uuid);

impl DownloadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DownloadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DownloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DownloadId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadStatus {
    /// Created, workers not yet dispatched.
    Pending,
    Downloading,
    /// Pause requested. Workers may still be draining.
    Paused,
    Completed,
    /// Every worker exited and at least one segment failed.
    Incomplete,
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DownloadStatus::Pending => "PENDING",
            DownloadStatus::Downloading => "DOWNLOADING",
            DownloadStatus::Paused => "PAUSED",
            DownloadStatus::Completed => "COMPLETED",
            DownloadStatus::Incomplete => "INCOMPLETE",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentStatus {
    Pending,
    Downloading,
    Paused,
    Failed,
    Completed,
}

impl fmt::Display for SegmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SegmentStatus::Pending => "PENDING",
            SegmentStatus::Downloading => "DOWNLOADING",
            SegmentStatus::Paused => "PAUSED",
            SegmentStatus::Failed => "FAILED",
            SegmentStatus::Completed => "COMPLETED",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Download {
    pub id: DownloadId,
    pub url: String,
    pub path: PathBuf,
    pub total_bytes: u64,
    pub status: DownloadStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Download {
    pub fn new(url: String, path: PathBuf, total_bytes: u64) -> Self {
        let now = Utc::now();
        Self {
            id: DownloadId::new(),
            url,
            path,
            total_bytes,
            status: DownloadStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: DownloadStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub download_id: DownloadId,
    pub index: usize,
    /// Inclusive.
    pub start: u64,
    /// Inclusive.
    pub end: u64,
    pub bytes_downloaded: u64,
    pub status: SegmentStatus,
}

impl Segment {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn remaining(&self) -> u64 {
        self.len().saturating_sub(self.bytes_downloaded)
    }

    /// Absolute file offset of the next byte to fetch.
    pub fn resume_offset(&self) -> u64 {
        self.start + self.bytes_downloaded
    }

    pub fn is_completed(&self) -> bool {
        self.status == SegmentStatus::Completed
    }
}
