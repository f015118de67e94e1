use reqwest::{header, Client, Response, StatusCode};
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{DownloadError, Result};

#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        // reqwest follows up to 10 redirects by default.
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self { client })
    }

    /// HEAD the resource and return its advertised length.
    ///
    /// The `Content-Length` header is read directly because the body size hint
    /// of a HEAD response is always zero.
    pub async fn probe(&self, url: &str) -> Result<u64> {
        let response = self.client.head(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::SizeUnavailable {
                url: url.to_string(),
                reason: format!("HEAD request failed with status {}", status),
            });
        }

        let length = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0);
        debug!(url, length, "probed content length");

        if length == 0 {
            return Err(DownloadError::SizeUnavailable {
                url: url.to_string(),
                reason: "missing or zero Content-Length".to_string(),
            });
        }
        Ok(length)
    }

    /// GET `bytes=from-to` (inclusive). Anything but 206 is rejected.
    pub async fn ranged_get(&self, url: &str, from: u64, to: u64) -> Result<Response> {
        let range_header = format!("bytes={}-{}", from, to);
        debug!(url, range = %range_header, "requesting range");
        let response = self
            .client
            .get(url)
            .header(header::RANGE, range_header)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::PARTIAL_CONTENT {
            return Err(DownloadError::RangeNotHonored { status });
        }
        Ok(response)
    }
}
