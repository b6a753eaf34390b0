// src/models.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::progress::format_speed;

/// Opaque task identifier (a v4 UUID rendered as a string).
pub type TaskId = String;

/// One contiguous, inclusive byte range of a download.
///
/// `index` fixes the position of the range in the merged artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    /// Number of bytes covered by this range. Never zero.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value for the HTTP `Range` request header.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// A progress sample emitted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub total: u64,
    /// Bytes per second since the previous sample.
    pub speed: u64,
}

/// The status of a download task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Whether a task in this status still owns its destination slot.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Downloading | TaskStatus::Paused
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a task's artifact lives, in terms of its owner and content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct DestinationSpec {
    /// One-way hash of the owning account. Never the plaintext identity.
    pub account_hash: String,
    pub content_id: String,
    pub version: String,
}

/// Input from the origin-discovery side: what to fetch and where it belongs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub url: String,
    #[serde(rename = "destinationSpec")]
    pub destination: DestinationSpec,
    /// Size hint from the origin metadata. The configured maximum is authoritative.
    #[serde(default, rename = "expectedMaxSizeBytes")]
    pub expected_max_size: Option<u64>,
    #[serde(default)]
    pub expected_sha256: Option<String>,
    /// Per-task thread count; the configured default applies when absent.
    #[serde(default)]
    pub threads: Option<usize>,
}

/// Represents the complete, persistent state of a single download task.
/// This struct is serialized into the task store as one record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadTask {
    pub id: TaskId,
    pub status: TaskStatus,
    pub url: String,
    pub destination: DestinationSpec,
    pub destination_path: PathBuf,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    /// Last sampled throughput in bytes per second.
    pub speed: u64,
    pub threads: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_max_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DownloadTask {
    pub fn new(
        id: TaskId,
        url: String,
        destination: DestinationSpec,
        destination_path: PathBuf,
        threads: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: TaskStatus::Pending,
            url,
            destination,
            destination_path,
            total_bytes: 0,
            downloaded_bytes: 0,
            speed: 0,
            threads: threads.max(1),
            expected_max_size: None,
            expected_sha256: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Calculates download progress as a fraction from 0.0 to 1.0.
    pub fn progress(&self) -> f32 {
        if self.total_bytes == 0 {
            if self.status == TaskStatus::Completed {
                1.0
            } else {
                0.0
            }
        } else {
            (self.downloaded_bytes as f32 / self.total_bytes as f32).min(1.0)
        }
    }

    /// Moves the task into `status`, clearing the error unless it failed.
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        if status != TaskStatus::Failed {
            self.error = None;
        }
        if status != TaskStatus::Downloading {
            self.speed = 0;
        }
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.set_status(TaskStatus::Failed);
        self.error = Some(reason.into());
    }

    /// Client-facing view without the source URL or the on-disk location.
    pub fn sanitize(&self, file_exists: bool) -> TaskView {
        TaskView {
            id: self.id.clone(),
            account_hash: self.destination.account_hash.clone(),
            content_id: self.destination.content_id.clone(),
            version: self.destination.version.clone(),
            status: self.status,
            progress: (self.progress() * 100.0).round() as u8,
            downloaded_bytes: self.downloaded_bytes,
            total_bytes: self.total_bytes,
            speed: format_speed(self.speed as f64),
            error: self.error.clone(),
            has_file: file_exists.then_some(true),
            created_at: self.created_at,
        }
    }
}

/// Sanitized task for API responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub id: TaskId,
    pub account_hash: String,
    pub content_id: String,
    pub version: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub speed: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_file: Option<bool>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> DownloadTask {
        DownloadTask::new(
            "task-1".into(),
            "https://cdn.example.com/app.ipa".into(),
            DestinationSpec {
                account_hash: "abcdef1234567890".into(),
                content_id: "com.example.app".into(),
                version: "1.0".into(),
            },
            PathBuf::from("/data/packages/abcdef1234567890/com.example.app/1.0/task-1.ipa"),
            4,
        )
    }

    #[test]
    fn chunk_range_is_inclusive() {
        let range = ChunkRange { index: 0, start: 10, end: 19 };
        assert_eq!(range.len(), 10);
        assert_eq!(range.header_value(), "bytes=10-19");
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::Downloading).unwrap(),
            "\"downloading\""
        );
        let status: TaskStatus = serde_json::from_str("\"paused\"").unwrap();
        assert_eq!(status, TaskStatus::Paused);
    }

    #[test]
    fn new_task_starts_pending() {
        let task = sample_task();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.total_bytes, 0);
        assert!(task.error.is_none());
        assert_eq!(task.progress(), 0.0);
    }

    #[test]
    fn fail_records_error_and_resume_clears_it() {
        let mut task = sample_task();
        task.fail("chunk 2 failed after 3 attempts");
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.as_deref().unwrap().contains("chunk 2"));

        task.set_status(TaskStatus::Pending);
        assert!(task.error.is_none());
    }

    #[test]
    fn create_request_uses_wire_names() {
        let req: CreateTaskRequest = serde_json::from_value(serde_json::json!({
            "url": "https://cdn.example.com/app.ipa",
            "destinationSpec": {
                "accountHash": "abcdef1234567890",
                "contentId": "com.example.app",
                "version": "2.1"
            },
            "expectedMaxSizeBytes": 1024
        }))
        .unwrap();
        assert_eq!(req.destination.content_id, "com.example.app");
        assert_eq!(req.expected_max_size, Some(1024));
        assert!(req.threads.is_none());
    }

    #[test]
    fn sanitized_view_hides_url_and_path() {
        let mut task = sample_task();
        task.total_bytes = 200;
        task.downloaded_bytes = 50;
        let json = serde_json::to_value(task.sanitize(false)).unwrap();
        assert!(json.get("url").is_none());
        assert!(json.get("destinationPath").is_none());
        assert!(json.get("hasFile").is_none());
        assert_eq!(json["progress"], 25);
        assert_eq!(json["accountHash"], "abcdef1234567890");
    }
}
