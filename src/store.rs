//! Persistence for download and segment records.
//!
//! The coordinator and workers only rely on single-record consistency: a
//! record that was saved is what the next `find_*` returns.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::state::{Download, DownloadId, Segment};

pub trait Store: Send + Sync {
    fn save_download(&self, download: &Download) -> Result<(), StoreError>;
    fn find_download(&self, id: DownloadId) -> Result<Option<Download>, StoreError>;
    fn save_segment(&self, segment: &Segment) -> Result<(), StoreError>;
    /// Segments of one download, ordered by index.
    fn find_segments(&self, id: DownloadId) -> Result<Vec<Segment>, StoreError>;
    fn list_downloads(&self) -> Result<Vec<Download>, StoreError>;

    fn save_segments(&self, segments: &[Segment]) -> Result<(), StoreError> {
        for segment in segments {
            self.save_segment(segment)?;
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
struct Snapshot {
    downloads: BTreeMap<DownloadId, Download>,
    segments: BTreeMap<DownloadId, BTreeMap<usize, Segment>>,
}

impl Snapshot {
    fn put_segment(&mut self, segment: &Segment) {
        self.segments
            .entry(segment.download_id)
            .or_default()
            .insert(segment.index, segment.clone());
    }

    fn segments_of(&self, id: DownloadId) -> Vec<Segment> {
        self.segments
            .get(&id)
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default()
    }

    fn sorted_downloads(&self) -> Vec<Download> {
        let mut downloads: Vec<Download> = self.downloads.values().cloned().collect();
        downloads.sort_by_key(|d| d.created_at);
        downloads
    }
}

/// Process-local store, used by tests and as a scratch backend.
#[derive(Default)]
pub struct MemoryStore {
    snapshot: Mutex<Snapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn save_download(&self, download: &Download) -> Result<(), StoreError> {
        self.snapshot.lock().downloads.insert(download.id, download.clone());
        Ok(())
    }

    fn find_download(&self, id: DownloadId) -> Result<Option<Download>, StoreError> {
        Ok(self.snapshot.lock().downloads.get(&id).cloned())
    }

    fn save_segment(&self, segment: &Segment) -> Result<(), StoreError> {
        self.snapshot.lock().put_segment(segment);
        Ok(())
    }

    fn find_segments(&self, id: DownloadId) -> Result<Vec<Segment>, StoreError> {
        Ok(self.snapshot.lock().segments_of(id))
    }

    fn list_downloads(&self) -> Result<Vec<Download>, StoreError> {
        Ok(self.snapshot.lock().sorted_downloads())
    }
}

pub const STATE_FILE_NAME: &str = "segdl-state.json";
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Whole-snapshot JSON file.
///
/// Download records and segment status changes are written through at once.
/// Plain byte-count updates are folded into the next write and hit the disk
/// at most once per flush interval, so a crash can lose recent progress but
/// never a status. Writes go to a sibling `.tmp` file that is renamed over
/// the real one, so a crash mid-write leaves the previous snapshot intact.
pub struct JsonFileStore {
    path: PathBuf,
    snapshot: Mutex<Snapshot>,
    /// Held for the duration of a file write; stores when the last one finished.
    writer: Mutex<Option<Instant>>,
    flush_interval: Duration,
}

impl JsonFileStore {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(STATE_FILE_NAME);
        let snapshot = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            Snapshot::default()
        };
        Ok(Self {
            path,
            snapshot: Mutex::new(snapshot),
            writer: Mutex::new(None),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        })
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serializes under the snapshot lock, then writes with only the writer
    /// lock held so readers are not blocked on disk I/O. Taking the writer lock
    /// before the snapshot lock is released keeps writes in snapshot order.
    fn persist(&self, snapshot: MutexGuard<'_, Snapshot>, force: bool) -> Result<(), StoreError> {
        let mut last = if force {
            self.writer.lock()
        } else {
            match self.writer.try_lock() {
                Some(last) => last,
                // The write in flight is older; the next forced one covers us.
                None => return Ok(()),
            }
        };
        if !force && matches!(*last, Some(at) if at.elapsed() < self.flush_interval) {
            return Ok(());
        }

        let content = serde_json::to_vec_pretty(&*snapshot)?;
        drop(snapshot);
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;
        *last = Some(Instant::now());
        Ok(())
    }
}

impl Store for JsonFileStore {
    fn save_download(&self, download: &Download) -> Result<(), StoreError> {
        let mut snapshot = self.snapshot.lock();
        snapshot.downloads.insert(download.id, download.clone());
        self.persist(snapshot, true)
    }

    fn find_download(&self, id: DownloadId) -> Result<Option<Download>, StoreError> {
        Ok(self.snapshot.lock().downloads.get(&id).cloned())
    }

    fn save_segment(&self, segment: &Segment) -> Result<(), StoreError> {
        let mut snapshot = self.snapshot.lock();
        let status_changed = snapshot
            .segments
            .get(&segment.download_id)
            .and_then(|s| s.get(&segment.index))
            .map_or(true, |old| old.status != segment.status);
        snapshot.put_segment(segment);
        self.persist(snapshot, status_changed)
    }

    fn save_segments(&self, segments: &[Segment]) -> Result<(), StoreError> {
        let mut snapshot = self.snapshot.lock();
        for segment in segments {
            snapshot.put_segment(segment);
        }
        self.persist(snapshot, true)
    }

    fn find_segments(&self, id: DownloadId) -> Result<Vec<Segment>, StoreError> {
        Ok(self.snapshot.lock().segments_of(id))
    }

    fn list_downloads(&self) -> Result<Vec<Download>, StoreError> {
        Ok(self.snapshot.lock().sorted_downloads())
    }
}
