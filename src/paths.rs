// src/paths.rs

//! On-disk layout and input validation.
//!
//! Artifacts live at `{packages}/{accountHash}/{contentId}/{version}/{taskId}.{ext}`
//! and chunk part-files sit next to them as `{taskId}.{ext}.part{index}`.

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

use crate::models::DestinationSpec;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("invalid {label}: must contain only alphanumeric characters, dots, dashes, or underscores")]
    InvalidSegment { label: &'static str },
    #[error("invalid accountHash: expected at least 8 characters")]
    ShortAccountHash,
    #[error("invalid download URL: {0}")]
    InvalidUrl(String),
    #[error("resolved path escapes the packages directory")]
    OutsideBase,
}

fn is_safe_segment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'
}

/// Validates a user-supplied path segment (account hash, content id, version).
pub fn validate_path_segment(value: &str, label: &'static str) -> Result<(), PathError> {
    if value.is_empty() || value == "." || value == ".." || !value.chars().all(is_safe_segment_char) {
        return Err(PathError::InvalidSegment { label });
    }
    Ok(())
}

/// Replaces unsafe characters with `_`. Rejects results that would still
/// resolve to the current or parent directory.
pub fn sanitize_path_segment(value: &str) -> Result<String, PathError> {
    let cleaned: String = value
        .chars()
        .map(|c| if is_safe_segment_char(c) { c } else { '_' })
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        return Err(PathError::InvalidSegment { label: "path segment" });
    }
    Ok(cleaned)
}

pub fn validate_destination(spec: &DestinationSpec) -> Result<(), PathError> {
    validate_path_segment(&spec.account_hash, "accountHash")?;
    if spec.account_hash.len() < 8 {
        return Err(PathError::ShortAccountHash);
    }
    validate_path_segment(&spec.content_id, "contentId")?;
    validate_path_segment(&spec.version, "version")?;
    Ok(())
}

/// Directory holding every artifact for one account/content/version triple.
pub fn task_dir(packages_dir: &Path, spec: &DestinationSpec) -> Result<PathBuf, PathError> {
    let dir = packages_dir
        .join(sanitize_path_segment(&spec.account_hash)?)
        .join(sanitize_path_segment(&spec.content_id)?)
        .join(sanitize_path_segment(&spec.version)?);
    if !path_within_base(&dir, packages_dir) {
        return Err(PathError::OutsideBase);
    }
    Ok(dir)
}

pub fn artifact_path(
    packages_dir: &Path,
    spec: &DestinationSpec,
    task_id: &str,
    extension: &str,
) -> Result<PathBuf, PathError> {
    let file_name = format!("{}.{}", sanitize_path_segment(task_id)?, extension);
    Ok(task_dir(packages_dir, spec)?.join(file_name))
}

/// Part-file holding chunk `index` of the artifact at `destination`.
pub fn part_path(destination: &Path, index: usize) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".part{index}"));
    destination.with_file_name(name)
}

/// Whether `file_name` is a part-file of the artifact named `artifact_name`.
pub fn is_part_file_of(file_name: &str, artifact_name: &str) -> bool {
    file_name
        .strip_prefix(artifact_name)
        .and_then(|rest| rest.strip_prefix(".part"))
        .map(|index| !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}

/// True when `resolved` lies strictly below `base` without `..` hops.
pub fn path_within_base(resolved: &Path, base: &Path) -> bool {
    resolved != base
        && resolved.starts_with(base)
        && !resolved
            .strip_prefix(base)
            .map(|rest| rest.components().any(|c| !matches!(c, Component::Normal(_))))
            .unwrap_or(true)
}

/// Accepts http(s) URLs with a host, optionally restricted to host suffixes.
pub fn validate_download_url(raw: &str, allowed_host_suffixes: &[String]) -> Result<url::Url, PathError> {
    let parsed = url::Url::parse(raw).map_err(|e| PathError::InvalidUrl(e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(PathError::InvalidUrl("scheme must be http or https".into()));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| PathError::InvalidUrl("missing host".into()))?
        .to_ascii_lowercase();
    if !allowed_host_suffixes.is_empty()
        && !allowed_host_suffixes
            .iter()
            .any(|suffix| host.ends_with(&suffix.to_ascii_lowercase()))
    {
        return Err(PathError::InvalidUrl(format!("host {host} is not allowed")));
    }
    Ok(parsed)
}

/// Filename safe to place inside a `Content-Disposition` header.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .filter(|&c| (c.is_ascii_graphic() || c == ' ') && c != '"' && c != '\\')
        .take(200)
        .collect()
}
