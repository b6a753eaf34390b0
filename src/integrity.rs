// src/integrity.rs

use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};

const READ_BUFFER: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed SHA-256 digest {0:?}")]
    MalformedDigest(String),
    #[error("expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },
}

/// Lowercase hex SHA-256 of everything in `path`.
pub async fn sha256_file(path: &Path) -> Result<String, IntegrityError> {
    let mut reader = BufReader::new(File::open(path).await?);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Trims and lowercases a hex digest, rejecting anything that is not 64 hex digits.
pub fn normalize_digest(raw: &str) -> Result<String, IntegrityError> {
    let digest = raw.trim().to_ascii_lowercase();
    if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(IntegrityError::MalformedDigest(raw.to_string()));
    }
    Ok(digest)
}

/// Hashes the merged artifact and compares it with `expected`.
pub async fn verify_artifact(path: &Path, expected: &str) -> Result<(), IntegrityError> {
    let expected = normalize_digest(expected)?;
    let actual = sha256_file(path).await?;
    if actual != expected {
        return Err(IntegrityError::Mismatch { expected, actual });
    }
    Ok(())
}
