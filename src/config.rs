use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SEGMENT_COUNT: usize = 8;
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Where destination files and the state file live.
    pub download_dir: PathBuf,
    pub segment_count: usize,
    /// Largest slice written between two pause checks.
    pub chunk_size: usize,
    /// Longest wait for the next body chunk before the segment fails.
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
    /// Global limit in bytes per second, shared by all workers.
    pub rate_limit: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            segment_count: DEFAULT_SEGMENT_COUNT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_timeout: DEFAULT_READ_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            user_agent: format!("segdl/{}", env!("CARGO_PKG_VERSION")),
            rate_limit: None,
        }
    }
}
