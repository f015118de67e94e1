use std::collections::HashMap;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use futures::future::{BoxFuture, FutureExt, Shared};
use governor::{Quota, RateLimiter};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::fs::{self, OpenOptions};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{DownloadError, Result};
use crate::plan::plan;
use crate::progress::ProgressAggregator;
use crate::registry::PauseRegistry;
use crate::state::{Download, DownloadId, DownloadStatus, Segment, SegmentStatus};
use crate::store::Store;
use crate::transport::HttpTransport;
use crate::utils::{get_filename_from_url, get_unique_filepath, sanitize_filename};
use crate::worker::{SegmentWorker, SharedRateLimiter};

type Batch = Shared<BoxFuture<'static, ()>>;

#[derive(Serialize, Debug, Clone)]
pub struct SegmentReport {
    pub index: usize,
    pub start: u64,
    pub end: u64,
    pub bytes_downloaded: u64,
    pub status: SegmentStatus,
}

#[derive(Serialize, Debug, Clone)]
pub struct StatusReport {
    pub id: DownloadId,
    pub url: String,
    pub path: PathBuf,
    pub status: DownloadStatus,
    pub total_bytes: u64,
    /// Sum of the persisted per-segment counts.
    pub downloaded_bytes: u64,
    pub segments: Vec<SegmentReport>,
}

impl StatusReport {
    fn new(download: Download, segments: &[Segment]) -> Self {
        Self {
            id: download.id,
            url: download.url,
            path: download.path,
            status: download.status,
            total_bytes: download.total_bytes,
            downloaded_bytes: segments.iter().map(|s| s.bytes_downloaded).sum(),
            segments: segments
                .iter()
                .map(|s| SegmentReport {
                    index: s.index,
                    start: s.start,
                    end: s.end,
                    bytes_downloaded: s.bytes_downloaded,
                    status: s.status,
                })
                .collect(),
        }
    }
}

/// Drives downloads through
/// `Pending -> Downloading <-> Paused`, `Downloading -> Completed | Incomplete`.
///
/// Every dispatch spawns one supervisor task that owns a `JoinSet` of
/// segment workers and is the only consumer of their outcomes. Download
/// status changes happen under `transitions`, so check-and-set sequences on
/// the download record never interleave.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    config: EngineConfig,
    store: Arc<dyn Store>,
    transport: HttpTransport,
    pauses: PauseRegistry,
    progress: DashMap<DownloadId, Arc<ProgressAggregator>>,
    batches: Mutex<HashMap<DownloadId, Batch>>,
    transitions: Mutex<()>,
    /// Downloads whose running batch is being cancelled by `retry`; their
    /// settle leaves the status alone.
    superseded: DashSet<DownloadId>,
    rate_limiter: Option<SharedRateLimiter>,
}

impl Coordinator {
    pub fn new(config: EngineConfig, store: Arc<dyn Store>) -> Result<Self> {
        let transport = HttpTransport::new(&config)?;
        let rate_limiter = config
            .rate_limit
            .and_then(NonZeroU32::new)
            .map(|limit| Arc::new(RateLimiter::direct(Quota::per_second(limit))));

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                transport,
                pauses: PauseRegistry::new(),
                progress: DashMap::new(),
                batches: Mutex::new(HashMap::new()),
                transitions: Mutex::new(()),
                superseded: DashSet::new(),
                rate_limiter,
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Probe, plan, pre-allocate, persist, then start every segment. Nothing is
    /// recorded if any step before the first save fails.
    pub async fn create(&self, url: &str, file_name: &str) -> Result<DownloadId> {
        let total_bytes = self.inner.transport.probe(url).await?;

        let name = if file_name.trim().is_empty() {
            get_filename_from_url(url)
        } else {
            file_name.to_string()
        };
        let dir = &self.inner.config.download_dir;
        fs::create_dir_all(dir).await?;
        let path = get_unique_filepath(dir, &sanitize_filename(&name));

        let download = Download::new(url.to_string(), path, total_bytes);
        let segments: Vec<Segment> = plan(total_bytes, self.inner.config.segment_count)?
            .into_iter()
            .enumerate()
            .map(|(index, range)| Segment {
                download_id: download.id,
                index,
                start: range.start,
                end: range.end,
                bytes_downloaded: 0,
                status: SegmentStatus::Pending,
            })
            .collect();

        if let Err(e) = allocate(&download.path, total_bytes, false).await {
            let _ = fs::remove_file(&download.path).await;
            return Err(e);
        }
        // Segments first: a download record is only listed once it has them.
        self.inner.store.save_segments(&segments)?;
        self.inner.store.save_download(&download)?;
        info!(
            download = %download.id,
            url,
            path = %download.path.display(),
            total_bytes,
            segments = segments.len(),
            "download created"
        );

        self.inner.pauses.register(download.id);
        self.dispatch(download.id, segments)?;
        Ok(download.id)
    }

    /// Records the pause and signals workers; does not wait for them.
    /// Pausing anything that is not downloading is a no-op.
    pub fn pause(&self, id: DownloadId) -> Result<()> {
        let _guard = self.inner.transitions.lock();
        let mut download = self.inner.load(id)?;
        if download.status != DownloadStatus::Downloading {
            debug!(download = %id, status = %download.status, "pause ignored");
            return Ok(());
        }
        download.set_status(DownloadStatus::Paused);
        self.inner.store.save_download(&download)?;
        self.inner.pauses.pause(id);
        info!(download = %id, "download paused");
        Ok(())
    }

    pub async fn resume(&self, id: DownloadId) -> Result<()> {
        self.inner.expect_status(id, DownloadStatus::Paused, "resume")?;

        // Workers of the paused batch stop waiting on the network at once.
        self.drain(id).await;
        self.inner.expect_status(id, DownloadStatus::Paused, "resume")?;

        let segments = self.inner.store.find_segments(id)?;
        if segments.is_empty() {
            return Err(DownloadError::NoSegments(id));
        }
        let download = self.inner.load(id)?;
        allocate(&download.path, download.total_bytes, false).await?;

        let pending: Vec<Segment> = segments.into_iter().filter(|s| !s.is_completed()).collect();

        self.inner.pauses.reset(id);
        info!(download = %id, segments = pending.len(), "download resumed");
        self.dispatch(id, pending)
    }

    /// `full` discards everything on disk and refetches every segment;
    /// otherwise only failed or paused segments are refetched.
    pub async fn retry(&self, id: DownloadId, full: bool) -> Result<()> {
        let download = {
            let _guard = self.inner.transitions.lock();
            let download = self.inner.load(id)?;
            if download.status == DownloadStatus::Pending {
                return Err(DownloadError::InvalidState {
                    id,
                    status: download.status,
                    operation: "retry",
                });
            }
            self.inner.superseded.insert(id);
            self.inner.pauses.pause(id);
            download
        };
        self.drain(id).await;

        if !self.inner.claim_retry(id, download.status)? {
            info!(download = %id, "paused while retry was draining; not restarting");
            return Ok(());
        }
        let restarted = self.restart(id, download, full).await;
        if restarted.is_err() {
            // Give the record a settled status instead of leaving it Downloading.
            if let Err(e) = self.inner.settle(id) {
                warn!(download = %id, error = %e, "could not settle after failed retry");
            }
        }
        restarted
    }

    async fn restart(&self, id: DownloadId, download: Download, full: bool) -> Result<()> {
        let mut segments = self.inner.store.find_segments(id)?;
        if segments.is_empty() {
            return Err(DownloadError::NoSegments(id));
        }
        let targets: Vec<Segment> = if full {
            allocate(&download.path, download.total_bytes, true).await?;
            for segment in segments.iter_mut() {
                segment.bytes_downloaded = 0;
                segment.status = SegmentStatus::Downloading;
            }
            self.inner.store.save_segments(&segments)?;
            segments
        } else {
            allocate(&download.path, download.total_bytes, false).await?;
            segments
                .into_iter()
                .filter(|s| matches!(s.status, SegmentStatus::Failed | SegmentStatus::Paused))
                .collect()
        };

        self.inner.pauses.reset(id);
        if targets.is_empty() {
            debug!(download = %id, "nothing to retry");
            self.inner.settle(id)?;
            return Ok(());
        }

        info!(download = %id, full, segments = targets.len(), "retrying download");
        self.dispatch(id, targets)
    }

    pub fn status(&self, id: DownloadId) -> Result<StatusReport> {
        let download = self.inner.load(id)?;
        let segments = self.inner.store.find_segments(id)?;
        Ok(StatusReport::new(download, &segments))
    }

    pub fn list(&self) -> Result<Vec<StatusReport>> {
        let mut reports = vec![];
        for download in self.inner.store.list_downloads()? {
            let segments = self.inner.store.find_segments(download.id)?;
            reports.push(StatusReport::new(download, &segments));
        }
        Ok(reports)
    }

    /// Live byte counter of the current batch, if one was dispatched.
    pub fn progress(&self, id: DownloadId) -> Option<Arc<ProgressAggregator>> {
        self.inner.progress.get(&id).map(|p| p.clone())
    }

    /// Waits until the current batch of workers has settled.
    pub async fn wait(&self, id: DownloadId) -> Result<StatusReport> {
        self.drain(id).await;
        self.status(id)
    }

    /// Marks downloads left active by a previous process as paused so they can
    /// be resumed from their persisted offsets.
    pub fn recover(&self) -> Result<usize> {
        let _guard = self.inner.transitions.lock();
        let mut recovered = 0;
        for mut download in self.inner.store.list_downloads()? {
            if !matches!(
                download.status,
                DownloadStatus::Downloading | DownloadStatus::Pending
            ) {
                continue;
            }
            if self.inner.batches.lock().contains_key(&download.id) {
                continue;
            }

            let mut segments = self.inner.store.find_segments(download.id)?;
            for segment in segments
                .iter_mut()
                .filter(|s| s.status == SegmentStatus::Downloading)
            {
                segment.status = SegmentStatus::Paused;
            }
            self.inner.store.save_segments(&segments)?;

            download.set_status(DownloadStatus::Paused);
            self.inner.store.save_download(&download)?;
            info!(download = %download.id, "recovered interrupted download as paused");
            recovered += 1;
        }
        Ok(recovered)
    }

    fn dispatch(&self, id: DownloadId, mut segments: Vec<Segment>) -> Result<()> {
        let download = {
            let _guard = self.inner.transitions.lock();
            let mut download = self.inner.load(id)?;
            download.set_status(DownloadStatus::Downloading);
            self.inner.store.save_download(&download)?;
            download
        };

        for segment in segments.iter_mut() {
            segment.status = SegmentStatus::Downloading;
        }
        self.inner.store.save_segments(&segments)?;

        let persisted: u64 = self
            .inner
            .store
            .find_segments(id)?
            .iter()
            .map(|s| s.bytes_downloaded)
            .sum();
        let progress = Arc::new(ProgressAggregator::new(persisted));
        self.inner.progress.insert(id, progress.clone());

        let cancel = self.inner.pauses.register(id);
        let chunk_size = match self.inner.config.rate_limit {
            Some(limit) if limit > 0 => self.inner.config.chunk_size.min(limit as usize),
            _ => self.inner.config.chunk_size,
        };

        let mut workers = JoinSet::new();
        for segment in segments {
            debug!(
                download = %id,
                segment = segment.index,
                from = segment.resume_offset(),
                to = segment.end,
                "dispatching segment"
            );
            let worker = SegmentWorker {
                transport: self.inner.transport.clone(),
                store: self.inner.store.clone(),
                progress: progress.clone(),
                cancel: cancel.clone(),
                url: download.url.clone(),
                path: download.path.clone(),
                segment,
                chunk_size,
                read_timeout: self.inner.config.read_timeout,
                rate_limiter: self.inner.rate_limiter.clone(),
            };
            workers.spawn(worker.run());
        }

        let inner = self.inner.clone();
        let supervisor = tokio::spawn(async move {
            while let Some(joined) = workers.join_next().await {
                let outcome = match joined {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(download = %id, error = %e, "segment worker aborted");
                        continue;
                    }
                };
                progress.record(outcome.status);
                debug!(
                    download = %id,
                    segment = outcome.index,
                    status = %outcome.status,
                    error = ?outcome.error.as_ref().map(|e| e.to_string()),
                    "segment settled"
                );
                if outcome.status == SegmentStatus::Completed {
                    if let Err(e) = inner.complete_if_done(id) {
                        warn!(download = %id, error = %e, "completion check failed");
                    }
                }
            }
            if let Err(e) = inner.settle(id) {
                warn!(download = %id, error = %e, "could not settle download");
            }
        });

        let batch: Batch = supervisor
            .map(|joined| {
                if let Err(e) = joined {
                    warn!(error = %e, "download supervisor aborted");
                }
            })
            .boxed()
            .shared();
        self.inner.batches.lock().insert(id, batch);
        Ok(())
    }

    async fn drain(&self, id: DownloadId) {
        let batch = self.inner.batches.lock().get(&id).cloned();
        if let Some(batch) = batch {
            batch.await;
        }
    }
}

impl Inner {
    fn load(&self, id: DownloadId) -> Result<Download> {
        self.store
            .find_download(id)?
            .ok_or(DownloadError::NotFound(id))
    }

    fn expect_status(
        &self,
        id: DownloadId,
        expected: DownloadStatus,
        operation: &'static str,
    ) -> Result<()> {
        let download = self.load(id)?;
        if download.status != expected {
            return Err(DownloadError::InvalidState {
                id,
                status: download.status,
                operation,
            });
        }
        Ok(())
    }

    /// Sets `Completed` if every segment is completed. Returns whether this
    /// call made the transition.
    fn complete_if_done(&self, id: DownloadId) -> Result<bool> {
        let _guard = self.transitions.lock();
        let mut download = self.load(id)?;
        if download.status == DownloadStatus::Completed {
            return Ok(false);
        }
        let segments = self.store.find_segments(id)?;
        if segments.is_empty() || !segments.iter().all(Segment::is_completed) {
            return Ok(false);
        }
        download.set_status(DownloadStatus::Completed);
        self.store.save_download(&download)?;
        self.pauses.remove(id);
        info!(download = %id, bytes = download.total_bytes, "download completed");
        Ok(true)
    }

    /// Ends the superseded window a `retry` opened. Returns false when the
    /// download was downloading at the start of the retry and got paused by
    /// the user before the old batch drained.
    fn claim_retry(&self, id: DownloadId, before: DownloadStatus) -> Result<bool> {
        let _guard = self.transitions.lock();
        self.superseded.remove(&id);
        let download = self.load(id)?;
        Ok(!(before == DownloadStatus::Downloading && download.status == DownloadStatus::Paused))
    }

    /// Derives the download status once no worker of the batch is running.
    fn settle(&self, id: DownloadId) -> Result<()> {
        if self.complete_if_done(id)? {
            return Ok(());
        }

        let _guard = self.transitions.lock();
        if self.superseded.contains(&id) {
            debug!(download = %id, "batch superseded by retry");
            return Ok(());
        }
        let mut download = self.load(id)?;
        if matches!(
            download.status,
            DownloadStatus::Completed | DownloadStatus::Paused
        ) {
            return Ok(());
        }

        let segments = self.store.find_segments(id)?;
        let any = |status: SegmentStatus| segments.iter().any(|s| s.status == status);
        let next = if segments.is_empty()
            || (any(SegmentStatus::Failed) && !any(SegmentStatus::Downloading))
        {
            DownloadStatus::Incomplete
        } else if any(SegmentStatus::Paused) {
            DownloadStatus::Paused
        } else {
            return Ok(());
        };

        if next != download.status {
            let failed = segments
                .iter()
                .filter(|s| s.status == SegmentStatus::Failed)
                .count();
            download.set_status(next);
            self.store.save_download(&download)?;
            info!(download = %id, status = %next, failed, "download settled");
        }
        Ok(())
    }
}

/// Sizes the destination file to `total_bytes`. With `discard`, existing
/// contents are truncated away first.
async fn allocate(path: &Path, total_bytes: u64, discard: bool) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .await?;
    if discard {
        file.set_len(0).await?;
    }
    if file.metadata().await?.len() != total_bytes {
        file.set_len(total_bytes).await?;
    }
    Ok(())
}
