// src/probe.rs

use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_LENGTH};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// What a metadata probe learned about the origin resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeResult {
    pub content_length: Option<u64>,
    pub accepts_ranges: bool,
}

impl ProbeResult {
    /// Byte ranges can only be planned against a known size. A known size
    /// of zero plans no ranges at all.
    pub fn supports_ranges(&self) -> bool {
        self.accepts_ranges && self.content_length.is_some()
    }

    pub fn from_headers(headers: &HeaderMap) -> Self {
        // Read the header directly: `Response::content_length` reports the
        // (empty) body size for HEAD responses.
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok());
        let accepts_ranges = headers
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').any(|unit| unit.trim().eq_ignore_ascii_case("bytes")))
            .unwrap_or(false);
        Self {
            content_length,
            accepts_ranges,
        }
    }
}

/// Issues a HEAD request against `url`.
///
/// A failed probe is not an error: it yields an unknown size without range
/// support, which sends the caller down the single-stream path.
pub async fn probe(client: &Client, url: &str, timeout: Duration) -> ProbeResult {
    match client.head(url).timeout(timeout).send().await {
        Ok(resp) if resp.status().is_success() => {
            let result = ProbeResult::from_headers(resp.headers());
            debug!(
                url,
                content_length = ?result.content_length,
                accepts_ranges = result.accepts_ranges,
                "probe complete"
            );
            result
        }
        Ok(resp) => {
            warn!(url, status = resp.status().as_u16(), "probe rejected, assuming no range support");
            ProbeResult::default()
        }
        Err(e) => {
            warn!(url, error = %e, "probe failed, assuming no range support");
            ProbeResult::default()
        }
    }
}
