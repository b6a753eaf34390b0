// src/fetcher.rs

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::downloader::DownloadError;
use crate::models::ChunkRange;
use crate::progress::ChunkCounter;

/// Fetches one byte range into its part-file. One attempt, no retries.
///
/// The part-file is truncated first, so a retry always starts the chunk over.
/// Bytes are reported through `counter` as they are written.
pub async fn fetch_chunk(
    client: &Client,
    url: &str,
    range: ChunkRange,
    total: u64,
    part: &Path,
    counter: &ChunkCounter,
    timeout: Duration,
) -> Result<(), DownloadError> {
    counter.set(0);

    let resp = client
        .get(url)
        .header(RANGE, range.header_value())
        .timeout(timeout)
        .send()
        .await?;

    let status = resp.status();
    let covers_everything = range.start == 0 && range.end + 1 == total;
    if status != StatusCode::PARTIAL_CONTENT && !(status == StatusCode::OK && covers_everything) {
        return Err(DownloadError::UnexpectedStatus(status.as_u16()));
    }
    if status == StatusCode::PARTIAL_CONTENT {
        let served = content_range(resp.headers());
        if served.map(|r| (r.start, r.end)) != Some((range.start, range.end)) {
            return Err(DownloadError::RangeMismatch {
                requested: range.header_value(),
                served: served.map(|r| r.to_string()),
            });
        }
    }

    let expected = range.len();
    let mut file = File::create(part).await?;
    let mut stream = resp.bytes_stream();
    let mut written = 0u64;

    while let Some(item) = stream.next().await {
        let bytes = item?;
        written += bytes.len() as u64;
        if written > expected {
            return Err(DownloadError::BodyLength {
                expected,
                actual: written,
            });
        }
        file.write_all(&bytes).await?;
        counter.add(bytes.len() as u64);
    }
    file.flush().await?;

    if written != expected {
        return Err(DownloadError::BodyLength {
            expected,
            actual: written,
        });
    }
    Ok(())
}

/// A parsed `Content-Range: bytes start-end/total` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    /// `None` when the origin sent `*` for the complete length.
    pub total: Option<u64>,
}

impl std::fmt::Display for ContentRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.total {
            Some(total) => write!(f, "bytes {}-{}/{}", self.start, self.end, total),
            None => write!(f, "bytes {}-{}/*", self.start, self.end),
        }
    }
}

impl ContentRange {
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.trim().strip_prefix("bytes")?.trim_start();
        let (span, total) = rest.split_once('/')?;
        let (start, end) = span.trim().split_once('-')?;
        let start = start.trim().parse().ok()?;
        let end = end.trim().parse().ok()?;
        if end < start {
            return None;
        }
        let total = match total.trim() {
            "*" => None,
            n => Some(n.parse().ok()?),
        };
        Some(Self { start, end, total })
    }
}

/// The `Content-Range` of a `206` response, if present and well formed.
pub fn content_range(headers: &HeaderMap) -> Option<ContentRange> {
    headers
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(ContentRange::parse)
}

/// Whether a part-file from an earlier run already holds the whole range.
pub async fn part_is_complete(part: &Path, range: &ChunkRange) -> bool {
    match tokio::fs::metadata(part).await {
        Ok(meta) => meta.is_file() && meta.len() == range.len(),
        Err(_) => false,
    }
}
