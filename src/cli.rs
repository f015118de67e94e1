use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{EngineConfig, DEFAULT_SEGMENT_COUNT};
use crate::state::DownloadId;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Segmented, resumable HTTP downloader", long_about = None)]
pub struct Args {
    /// Directory to save downloaded files and the state file
    #[arg(short = 'd', long = "download-dir", default_value = "downloads", global = true)]
    pub download_dir: PathBuf,

    /// Number of segments per file
    #[arg(short = 's', long, default_value_t = DEFAULT_SEGMENT_COUNT, global = true)]
    pub split: usize,

    /// Global rate limit in bytes per second (e.g., 1048576 for 1MB/s)
    #[arg(short = 'r', long, global = true)]
    pub rate_limit: Option<u32>,

    /// Seconds to wait for the next chunk before a segment fails
    #[arg(long, default_value_t = 30, global = true)]
    pub read_timeout: u64,

    /// Enable debug logging
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start a new download and follow it until it finishes (Ctrl+C pauses)
    Get {
        url: String,
        /// File name to save as (defaults to the last URL path segment)
        #[arg(short = 'n', long = "name", default_value = "")]
        name: String,
    },
    /// Resume a paused download
    Resume { id: DownloadId },
    /// Retry failed or paused segments; --full restarts from scratch
    Retry {
        id: DownloadId,
        #[arg(long)]
        full: bool,
    },
    /// Show one download with per-segment detail
    Status {
        id: DownloadId,
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },
    /// List all known downloads
    List,
}

impl Args {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            download_dir: self.download_dir.clone(),
            segment_count: self.split,
            read_timeout: Duration::from_secs(self.read_timeout),
            rate_limit: self.rate_limit,
            ..EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retry_full() {
        let id = DownloadId::new();
        let id_arg = id.to_string();
        let args = Args::parse_from(["segdl", "retry", id_arg.as_str(), "--full", "-s", "4"]);
        match args.command {
            Command::Retry { id: parsed, full } => {
                assert_eq!(parsed, id);
                assert!(full);
            }
            other => panic!("unexpected command {:?}", other),
        }
        let config = args.engine_config();
        assert_eq!(config.segment_count, 4);
        assert_eq!(config.read_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_parse_get_defaults() {
        let args = Args::parse_from(["segdl", "get", "https://example.com/a.iso"]);
        assert!(matches!(args.command, Command::Get { ref name, .. } if name.is_empty()));
        assert_eq!(args.split, 8);
        assert_eq!(args.download_dir, PathBuf::from("downloads"));
    }

    #[test]
    fn test_rejects_bad_id() {
        assert!(Args::try_parse_from(["segdl", "resume", "not-a-uuid"]).is_err());
    }
}
