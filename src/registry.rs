use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::state::DownloadId;

/// Cooperative pause signal per download.
///
/// A reset swaps in a fresh token instead of un-cancelling the old one, so a
/// worker from a paused batch that checks late still sees the pause.
#[derive(Debug, Default)]
pub struct PauseRegistry {
    tokens: DashMap<DownloadId, CancellationToken>,
}

impl PauseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current token, creating an unpaused one if absent.
    pub fn register(&self, id: DownloadId) -> CancellationToken {
        self.tokens.entry(id).or_insert_with(CancellationToken::new).clone()
    }

    pub fn pause(&self, id: DownloadId) {
        if let Some(token) = self.tokens.get(&id) {
            token.cancel();
        }
    }

    pub fn reset(&self, id: DownloadId) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.insert(id, token.clone());
        token
    }

    pub fn remove(&self, id: DownloadId) {
        self.tokens.remove(&id);
    }
}
