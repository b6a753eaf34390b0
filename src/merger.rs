// src/merger.rs

use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::downloader::DownloadError;
use crate::models::ChunkRange;
use crate::paths::{is_part_file_of, part_path};

/// Concatenates the part-files of `ranges` into `destination` in index order,
/// then deletes them. Returns the number of bytes written.
///
/// Every part must exist and hold exactly its planned length; anything else
/// points at a disk problem or a bug and fails the merge.
pub async fn merge_parts(destination: &Path, ranges: &[ChunkRange]) -> Result<u64, DownloadError> {
    let merge_err = |what: String| DownloadError::Merge(what);

    let mut ordered = ranges.to_vec();
    ordered.sort_by_key(|r| r.index);

    let mut out = File::create(destination)
        .await
        .map_err(|e| merge_err(format!("create {}: {e}", destination.display())))?;
    let mut written = 0u64;

    for range in &ordered {
        let part = part_path(destination, range.index);
        let mut input = File::open(&part)
            .await
            .map_err(|e| merge_err(format!("part {} unreadable: {e}", range.index)))?;
        let len = input
            .metadata()
            .await
            .map_err(|e| merge_err(format!("part {} unreadable: {e}", range.index)))?
            .len();
        if len != range.len() {
            return Err(merge_err(format!(
                "part {} holds {len} bytes, expected {}",
                range.index,
                range.len()
            )));
        }
        written += tokio::io::copy(&mut input, &mut out)
            .await
            .map_err(|e| merge_err(format!("copy part {}: {e}", range.index)))?;
    }

    out.flush().await.map_err(|e| merge_err(e.to_string()))?;
    out.sync_all().await.map_err(|e| merge_err(e.to_string()))?;
    drop(out);

    for range in &ordered {
        let part = part_path(destination, range.index);
        if let Err(e) = tokio::fs::remove_file(&part).await {
            warn!(part = %part.display(), error = %e, "failed to remove merged part-file");
        }
    }
    debug!(destination = %destination.display(), bytes = written, parts = ordered.len(), "merge complete");
    Ok(written)
}

/// Deletes every part-file belonging to `destination`. Best-effort: errors
/// are logged and swallowed. Returns how many files were removed.
pub async fn cleanup_parts(destination: &Path) -> usize {
    let (Some(dir), Some(name)) = (destination.parent(), destination.file_name()) else {
        return 0;
    };
    let artifact_name = name.to_string_lossy().into_owned();

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    let mut removed = 0;
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "part-file scan interrupted");
                break;
            }
        };
        let file_name = entry.file_name();
        if !is_part_file_of(&file_name.to_string_lossy(), &artifact_name) {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => warn!(part = %entry.path().display(), error = %e, "failed to remove part-file"),
        }
    }
    removed
}
