// src/upload.rs

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::fmt::Display;
use std::path::Path;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::store::StoreError;

/// The only body type accepted for an uploaded artifact.
pub const UPLOAD_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload of {size} bytes exceeds the limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },
    #[error("unsupported content type {0:?}, expected application/octet-stream")]
    UnsupportedMediaType(String),
    #[error("invalid upload: {0}")]
    InvalidInput(String),
    #[error("upload io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task store error: {0}")]
    Store(#[from] StoreError),
}

impl UploadError {
    /// HTTP status the upload surface answers with.
    pub fn status_code(&self) -> u16 {
        match self {
            UploadError::TooLarge { .. } => 413,
            UploadError::UnsupportedMediaType(_) => 415,
            UploadError::InvalidInput(_) => 400,
            UploadError::Io(_) | UploadError::Store(_) => 500,
        }
    }
}

pub fn check_content_type(content_type: Option<&str>) -> Result<(), UploadError> {
    let essence = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
        .unwrap_or_default();
    if essence != UPLOAD_CONTENT_TYPE {
        return Err(UploadError::UnsupportedMediaType(essence));
    }
    Ok(())
}

/// Streams `body` into `path`, counting bytes as they arrive.
///
/// Passing `limit` aborts the transfer. On any error the partial file is
/// deleted. Returns the number of bytes stored.
pub async fn receive_upload<S, E>(path: &Path, limit: u64, mut body: S) -> Result<u64, UploadError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let result = write_body(path, limit, &mut body).await;
    if let Err(e) = &result {
        debug!(path = %path.display(), error = %e, "upload aborted");
        if let Err(err) = tokio::fs::remove_file(path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %err, "failed to remove partial upload");
            }
        }
    }
    result
}

async fn write_body<S, E>(path: &Path, limit: u64, body: &mut S) -> Result<u64, UploadError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    let mut file = File::create(path).await?;
    let mut received = 0u64;

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| UploadError::InvalidInput(format!("body interrupted: {e}")))?;
        received += chunk.len() as u64;
        if received > limit {
            return Err(UploadError::TooLarge { size: received, limit });
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;

    if received == 0 {
        return Err(UploadError::InvalidInput("empty body".into()));
    }
    Ok(received)
}
