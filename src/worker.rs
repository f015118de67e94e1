use std::future::Future;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::RateLimiter;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{DownloadError, Result};
use crate::progress::ProgressAggregator;
use crate::state::{Segment, SegmentStatus};
use crate::store::Store;
use crate::transport::HttpTransport;

pub type SharedRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

#[derive(Debug)]
pub struct SegmentOutcome {
    pub index: usize,
    pub status: SegmentStatus,
    pub error: Option<DownloadError>,
}

/// Fetches one segment's remaining byte range into its slot of the
/// destination file.
///
/// The worker owns its segment record for its whole run; nothing else writes
/// that record until the worker returns.
pub struct SegmentWorker {
    pub transport: HttpTransport,
    pub store: Arc<dyn Store>,
    pub progress: Arc<ProgressAggregator>,
    pub cancel: CancellationToken,
    pub url: String,
    pub path: PathBuf,
    pub segment: Segment,
    pub chunk_size: usize,
    pub read_timeout: Duration,
    pub rate_limiter: Option<SharedRateLimiter>,
}

impl SegmentWorker {
    pub async fn run(mut self) -> SegmentOutcome {
        let index = self.segment.index;
        match self.fetch().await {
            Ok(status) => SegmentOutcome {
                index,
                status,
                error: None,
            },
            Err(e) => {
                warn!(
                    download = %self.segment.download_id,
                    segment = index,
                    offset = self.segment.bytes_downloaded,
                    transport = e.is_transport(),
                    error = %e,
                    "segment failed"
                );
                self.segment.status = SegmentStatus::Failed;
                if let Err(store_err) = self.store.save_segment(&self.segment) {
                    warn!(segment = index, error = %store_err, "could not persist failed segment");
                }
                SegmentOutcome {
                    index,
                    status: SegmentStatus::Failed,
                    error: Some(e),
                }
            }
        }
    }

    async fn fetch(&mut self) -> Result<SegmentStatus> {
        self.finish(SegmentStatus::Downloading)?;

        if self.segment.remaining() == 0 {
            return self.finish(SegmentStatus::Completed);
        }
        if self.cancel.is_cancelled() {
            return self.finish(SegmentStatus::Paused);
        }

        let from = self.segment.resume_offset();
        let request = self.transport.ranged_get(&self.url, from, self.segment.end);
        let answered = self.guarded(request).await;
        let response = match answered {
            Some(response) => response??,
            None => return self.finish(SegmentStatus::Paused),
        };

        let mut file = OpenOptions::new().write(true).open(&self.path).await?;
        file.seek(SeekFrom::Start(from)).await?;

        let mut stream = response.bytes_stream();
        'stream: loop {
            let read = self.guarded(stream.next()).await;
            let next = match read {
                Some(next) => next?,
                None => return self.finish(SegmentStatus::Paused),
            };
            let Some(item) = next else {
                break;
            };
            let chunk = item?;

            for piece in chunk.chunks(self.chunk_size) {
                if self.cancel.is_cancelled() {
                    debug!(
                        download = %self.segment.download_id,
                        segment = self.segment.index,
                        offset = self.segment.bytes_downloaded,
                        "pause observed"
                    );
                    return self.finish(SegmentStatus::Paused);
                }

                let piece = &piece[..piece.len().min(self.segment.remaining() as usize)];

                if let Some(limiter) = &self.rate_limiter {
                    if let Some(n) = NonZeroU32::new(piece.len() as u32) {
                        limiter.until_n_ready(n).await?;
                    }
                }

                file.write_all(piece).await?;
                file.flush().await?;

                let len = piece.len() as u64;
                self.segment.bytes_downloaded += len;
                self.store.save_segment(&self.segment)?;
                self.progress.add(len);

                // Done once the range is full, without waiting for EOF.
                if self.segment.remaining() == 0 {
                    break 'stream;
                }
            }
        }

        if self.segment.remaining() > 0 {
            return Err(DownloadError::IncompleteTransfer {
                expected: self.segment.len(),
                received: self.segment.bytes_downloaded,
            });
        }
        self.finish(SegmentStatus::Completed)
    }

    /// Bounds one network wait by `read_timeout`. `None` means the pause
    /// signal fired first.
    async fn guarded<F: Future>(&self, wait: F) -> Option<Result<F::Output>> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            timed = tokio::time::timeout(self.read_timeout, wait) => Some(timed.map_err(|_| {
                DownloadError::Stalled {
                    after: self.read_timeout,
                }
            })),
        }
    }

    fn finish(&mut self, status: SegmentStatus) -> Result<SegmentStatus> {
        self.segment.status = status;
        self.store.save_segment(&self.segment)?;
        Ok(status)
    }
}
