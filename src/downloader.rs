// src/downloader.rs

use futures_util::StreamExt;
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::fetcher::{content_range, fetch_chunk, part_is_complete};
use crate::integrity::{verify_artifact, IntegrityError};
use crate::merger::{cleanup_parts, merge_parts};
use crate::models::ChunkRange;
use crate::paths::part_path;
use crate::planner::plan_chunks;
use crate::probe::{probe, ProbeResult};
use crate::progress::{spawn_sampler, ProgressBoard, ProgressCallback, ProgressReporter};
use crate::retry::{retry, RetryError, RetryPolicy};

/// Custom errors for download operations.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected HTTP status {0}")]
    UnexpectedStatus(u16),
    #[error("body length mismatch: expected {expected} bytes, received {actual}")]
    BodyLength { expected: u64, actual: u64 },
    #[error("origin served {served:?} for {requested}")]
    RangeMismatch { requested: String, served: Option<String> },
    #[error("resource size {size} exceeds the limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },
    #[error("chunk {index} failed after {attempts} attempts: {source}")]
    ChunkFailed {
        index: usize,
        attempts: u32,
        #[source]
        source: Box<DownloadError>,
    },
    #[error("merge failed: {0}")]
    Merge(String),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("integrity check failed: {0}")]
    Integrity(IntegrityError),
    #[error("download worker failed: {0}")]
    Worker(String),
    #[error("download cancelled")]
    Cancelled,
}

impl DownloadError {
    /// Transient failures a chunk fetch may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DownloadError::Network(_)
                | DownloadError::Io(_)
                | DownloadError::UnexpectedStatus(_)
                | DownloadError::BodyLength { .. }
                | DownloadError::RangeMismatch { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DownloadError::Cancelled)
    }
}

/// Everything one engine run needs to know about its resource.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub destination: PathBuf,
    pub threads: usize,
    /// Size hint from the caller. Only logged; the configured limit decides.
    pub size_hint: Option<u64>,
    /// Size recorded by an earlier run. Part-files are reused only if the
    /// probe still reports this size.
    pub previous_total: Option<u64>,
    pub expected_sha256: Option<String>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>, threads: usize) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            threads: threads.max(1),
            size_hint: None,
            previous_total: None,
            expected_sha256: None,
        }
    }
}

/// How a run fetched its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Chunked { chunks: usize, reused: usize },
    SingleStream { resumed_from: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub total_bytes: u64,
    pub strategy: Strategy,
}

/// The chunked parallel download engine. One instance serves many runs;
/// all of them share its HTTP client.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: Client,
    config: EngineConfig,
}

impl Downloader {
    pub fn new(config: EngineConfig) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Downloads `request.url` into `request.destination`.
    ///
    /// On failure every part-file and any partial destination file is removed.
    /// On cancellation they are kept so a later run can pick them up.
    pub async fn download(
        &self,
        request: &DownloadRequest,
        token: &CancellationToken,
        on_progress: ProgressCallback,
    ) -> Result<DownloadOutcome, DownloadError> {
        let result = self.run(request, token, on_progress).await;
        match &result {
            Ok(outcome) => {
                info!(
                    destination = %request.destination.display(),
                    bytes = outcome.total_bytes,
                    strategy = ?outcome.strategy,
                    "download complete"
                );
            }
            Err(e) if e.is_cancelled() => {
                info!(destination = %request.destination.display(), "download cancelled, partial data kept");
            }
            Err(e) => {
                let removed = cleanup_parts(&request.destination).await;
                if let Err(err) = tokio::fs::remove_file(&request.destination).await {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        warn!(destination = %request.destination.display(), error = %err, "failed to remove partial artifact");
                    }
                }
                warn!(
                    destination = %request.destination.display(),
                    error = %e,
                    parts_removed = removed,
                    "download failed"
                );
            }
        }
        result
    }

    async fn run(
        &self,
        request: &DownloadRequest,
        token: &CancellationToken,
        on_progress: ProgressCallback,
    ) -> Result<DownloadOutcome, DownloadError> {
        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let probed = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            probed = probe(&self.client, &request.url, self.config.request_timeout) => probed,
        };

        let limit = self.config.max_download_size;
        if let Some(size) = probed.content_length {
            if size > limit {
                return Err(DownloadError::TooLarge { size, limit });
            }
            if let Some(hint) = request.size_hint.filter(|hint| size > *hint) {
                warn!(url = %request.url, size, hint, "resource is larger than the expected size");
            }
        }

        let unchanged = request.previous_total.is_some_and(|t| t > 0 && probed.content_length == Some(t));
        if !unchanged {
            let removed = cleanup_parts(&request.destination).await;
            let stale_output = discard_file(&request.destination).await?;
            if removed > 0 || stale_output {
                info!(
                    previous = ?request.previous_total,
                    current = ?probed.content_length,
                    removed,
                    stale_output,
                    "partial data does not match the resource, discarded"
                );
            }
        }

        if let Some(parent) = request.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match probed.content_length {
            Some(total) if probed.supports_ranges() && request.threads > 1 => {
                self.download_chunked(request, total, token, on_progress).await
            }
            _ => {
                debug!(
                    url = %request.url,
                    accepts_ranges = probed.accepts_ranges,
                    threads = request.threads,
                    "using single stream"
                );
                self.download_single(request, probed, token, on_progress).await
            }
        }
    }

    async fn download_chunked(
        &self,
        request: &DownloadRequest,
        total: u64,
        token: &CancellationToken,
        on_progress: ProgressCallback,
    ) -> Result<DownloadOutcome, DownloadError> {
        let destination = &request.destination;
        let ranges = plan_chunks(total, request.threads);

        if ranges.is_empty() {
            File::create(destination).await?;
            self.verify(request).await?;
            ProgressReporter::new(0, 0, self.config.progress_interval, on_progress).finish(0);
            return Ok(DownloadOutcome {
                total_bytes: 0,
                strategy: Strategy::Chunked { chunks: 0, reused: 0 },
            });
        }

        let board = ProgressBoard::new(ranges.len());
        let mut pending = Vec::with_capacity(ranges.len());
        for range in &ranges {
            if part_is_complete(&part_path(destination, range.index), range).await {
                board.counter(range.index).set(range.len());
            } else {
                pending.push(*range);
            }
        }
        let reused = ranges.len() - pending.len();

        let initial = board.total();
        let mut reporter = ProgressReporter::new(total, initial, self.config.progress_interval, on_progress);
        reporter.sample(initial);
        info!(
            destination = %destination.display(),
            total,
            chunks = ranges.len(),
            reused,
            "starting chunked download"
        );

        let stop_sampler = CancellationToken::new();
        let sampler = spawn_sampler(Arc::clone(&board), reporter, stop_sampler.clone());
        let fetched = self.fetch_all(request, total, &pending, &board, token).await;
        stop_sampler.cancel();
        let mut reporter = sampler
            .await
            .map_err(|e| DownloadError::Worker(e.to_string()))?;
        fetched?;

        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let merged = merge_parts(destination, &ranges).await?;
        self.verify(request).await?;
        reporter.finish(merged);

        Ok(DownloadOutcome {
            total_bytes: merged,
            strategy: Strategy::Chunked {
                chunks: ranges.len(),
                reused,
            },
        })
    }

    /// Fetches `pending` ranges in parallel, one task per range.
    ///
    /// The first chunk to exhaust its retries stops the others, so that the
    /// caller's cleanup never races a writer.
    async fn fetch_all(
        &self,
        request: &DownloadRequest,
        total: u64,
        pending: &[ChunkRange],
        board: &Arc<ProgressBoard>,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let run_token = token.child_token();
        let policy = RetryPolicy::new(self.config.chunk_retries, self.config.retry_delay);
        let timeout = self.config.request_timeout;
        let mut set = JoinSet::new();

        for range in pending.iter().copied() {
            let client = self.client.clone();
            let url = request.url.clone();
            let part = part_path(&request.destination, range.index);
            let counter = board.counter(range.index);
            let chunk_token = run_token.clone();

            set.spawn(async move {
                let (client, url, part, counter) = (&client, url.as_str(), part.as_path(), &counter);
                let outcome = retry(policy, &chunk_token, DownloadError::is_retryable, move |attempt| async move {
                    let result = fetch_chunk(client, url, range, total, part, counter, timeout).await;
                    if let Err(e) = &result {
                        warn!(chunk = range.index, attempt, error = %e, "chunk attempt failed");
                    }
                    result
                })
                .await;

                match outcome {
                    Ok(()) => Ok(range.index),
                    Err(RetryError::Cancelled) => Err(DownloadError::Cancelled),
                    Err(RetryError::Exhausted { attempts, last }) => Err(DownloadError::ChunkFailed {
                        index: range.index,
                        attempts,
                        source: Box::new(last),
                    }),
                }
            });
        }

        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            let result = joined
                .map_err(|e| DownloadError::Worker(e.to_string()))
                .and_then(|r| r);
            match result {
                Ok(index) => debug!(chunk = index, "chunk complete"),
                Err(e) => {
                    if first_error.is_none() {
                        if !e.is_cancelled() {
                            warn!(error = %e, "chunk failed, stopping the remaining chunks");
                        }
                        run_token.cancel();
                        first_error = Some(e);
                    }
                }
            }
        }

        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Streams the whole body straight into the destination file.
    ///
    /// If an earlier run left a shorter file behind and the origin takes
    /// ranges, the request asks for the rest and appends to it.
    async fn download_single(
        &self,
        request: &DownloadRequest,
        probed: ProbeResult,
        token: &CancellationToken,
        on_progress: ProgressCallback,
    ) -> Result<DownloadOutcome, DownloadError> {
        let destination = &request.destination;
        let limit = self.config.max_download_size;

        let existing = match tokio::fs::metadata(destination).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => 0,
        };
        let resume_from = match probed.content_length {
            Some(total) if probed.accepts_ranges && existing > 0 && existing < total => existing,
            _ => 0,
        };

        let mut builder = self.client.get(&request.url).timeout(self.config.request_timeout);
        if resume_from > 0 {
            builder = builder.header(RANGE, format!("bytes={resume_from}-"));
        }
        let resp = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            resp = builder.send() => resp?,
        };

        let status = resp.status();
        let offset = if resume_from > 0 && status == StatusCode::PARTIAL_CONTENT {
            let served = content_range(resp.headers());
            if served.map(|r| r.start) != Some(resume_from) {
                return Err(DownloadError::RangeMismatch {
                    requested: format!("bytes={resume_from}-"),
                    served: served.map(|r| r.to_string()),
                });
            }
            resume_from
        } else if status == StatusCode::PARTIAL_CONTENT {
            return Err(DownloadError::UnexpectedStatus(status.as_u16()));
        } else if status.is_success() {
            0
        } else {
            return Err(DownloadError::UnexpectedStatus(status.as_u16()));
        };

        let declared = resp.content_length().map(|len| offset + len);
        if let Some(size) = declared {
            if size > limit {
                return Err(DownloadError::TooLarge { size, limit });
            }
        }

        let mut file = if offset > 0 {
            info!(destination = %destination.display(), offset, "resuming single stream");
            OpenOptions::new().append(true).open(destination).await?
        } else {
            File::create(destination).await?
        };

        let total = declared.or(probed.content_length).unwrap_or(0);
        let mut reporter = ProgressReporter::new(total, offset, self.config.progress_interval, on_progress);
        reporter.sample(offset);

        let mut written = offset;
        let mut stream = resp.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    file.flush().await?;
                    return Err(DownloadError::Cancelled);
                }
                next = stream.next() => next,
            };
            let Some(item) = next else { break };
            let bytes = item?;
            written += bytes.len() as u64;
            if written > limit {
                return Err(DownloadError::TooLarge { size: written, limit });
            }
            file.write_all(&bytes).await?;
            reporter.maybe_sample(written);
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Some(expected) = declared {
            if written != expected {
                return Err(DownloadError::BodyLength {
                    expected,
                    actual: written,
                });
            }
        }

        self.verify(request).await?;
        reporter.finish(written);

        Ok(DownloadOutcome {
            total_bytes: written,
            strategy: Strategy::SingleStream { resumed_from: offset },
        })
    }

    async fn verify(&self, request: &DownloadRequest) -> Result<(), DownloadError> {
        let Some(expected) = request.expected_sha256.as_deref() else {
            return Ok(());
        };
        verify_artifact(&request.destination, expected)
            .await
            .map_err(|e| match e {
                IntegrityError::Mismatch { expected, actual } => DownloadError::ChecksumMismatch { expected, actual },
                other => DownloadError::Integrity(other),
            })
    }
}

/// Removes a leftover file at `path`. Returns whether one existed.
async fn discard_file(path: &std::path::Path) -> Result<bool, DownloadError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
