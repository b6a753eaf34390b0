// src/manager.rs

use bytes::Bytes;
use chrono::Utc;
use futures_util::Stream;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ManagerConfig;
use crate::downloader::{DownloadRequest, Downloader};
use crate::integrity::{normalize_digest, IntegrityError};
use crate::merger::cleanup_parts;
use crate::models::{CreateTaskRequest, DestinationSpec, DownloadProgress, DownloadTask, TaskId, TaskStatus, TaskView};
use crate::paths::{artifact_path, validate_destination, validate_download_url, PathError};
use crate::progress::ProgressCallback;
use crate::store::{StoreError, TaskStore};
use crate::upload::{check_content_type, receive_upload, UploadError};

/// How often the scheduler looks for pending tasks when nothing wakes it.
const SCHEDULER_TICK: Duration = Duration::from_millis(500);

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("task store error: {0}")]
    Store(#[from] StoreError),
    #[error("task {0} not found")]
    NotFound(TaskId),
    #[error("cannot {action} task {id} while it is {status}")]
    InvalidState {
        id: TaskId,
        status: TaskStatus,
        action: &'static str,
    },
    #[error("task {existing} is already active for this destination")]
    Conflict { existing: TaskId },
    #[error(transparent)]
    Validation(#[from] PathError),
    #[error("invalid expectedSha256: {0}")]
    Digest(#[from] IntegrityError),
}

/// Change notification for transports that push instead of poll.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TaskEvent {
    Updated { task: TaskView },
    Removed {
        id: TaskId,
        #[serde(rename = "accountHash")]
        account_hash: String,
    },
}

/// A completed task whose artifact is on disk.
#[derive(Debug, Clone)]
pub struct PackageInfo {
    pub task: DownloadTask,
    pub file_size: u64,
}

struct ActiveRun {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns every task's lifecycle: creation, the bounded worker pool that drives
/// engine runs, and pause/resume/delete.
pub struct TaskManager {
    store: Arc<dyn TaskStore>,
    downloader: Downloader,
    config: ManagerConfig,
    runs: Mutex<HashMap<TaskId, ActiveRun>>,
    // Serializes the collision check in `create` with the insert.
    create_lock: Mutex<()>,
    wake: Notify,
    events: broadcast::Sender<TaskEvent>,
}

impl TaskManager {
    /// Builds the manager and reverts tasks left `downloading` by a previous
    /// process to `paused`. No run is started until `run` is called.
    pub async fn new(
        store: Arc<dyn TaskStore>,
        downloader: Downloader,
        config: ManagerConfig,
    ) -> Result<Self, ManagerError> {
        let mut recovered = 0;
        for task in store.list().await? {
            if task.status == TaskStatus::Downloading {
                store
                    .update(
                        &task.id,
                        Box::new(|t| {
                            if t.status == TaskStatus::Downloading {
                                t.set_status(TaskStatus::Paused);
                            }
                        }),
                    )
                    .await?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(recovered, "interrupted downloads moved to paused");
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            store,
            downloader,
            config,
            runs: Mutex::new(HashMap::new()),
            create_lock: Mutex::new(()),
            wake: Notify::new(),
            events,
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Accepts a new download. Fails if a pending, downloading or paused task
    /// already targets the same account/content/version.
    pub async fn create(&self, request: CreateTaskRequest) -> Result<DownloadTask, ManagerError> {
        validate_download_url(&request.url, &self.config.allowed_host_suffixes)?;
        validate_destination(&request.destination)?;
        let expected_sha256 = request.expected_sha256.as_deref().map(normalize_digest).transpose()?;

        let _guard = self.create_lock.lock().await;
        if let Some(existing) = self
            .store
            .list()
            .await?
            .into_iter()
            .find(|t| t.destination == request.destination && t.status.is_active())
        {
            return Err(ManagerError::Conflict { existing: existing.id });
        }

        let id = Uuid::new_v4().to_string();
        let path = artifact_path(
            &self.config.packages_dir,
            &request.destination,
            &id,
            &self.config.artifact_extension,
        )?;
        let threads = request.threads.unwrap_or(self.config.threads_per_task);
        let mut task = DownloadTask::new(id, request.url, request.destination, path, threads);
        task.expected_max_size = request.expected_max_size;
        task.expected_sha256 = expected_sha256;

        self.store.create(&task).await?;
        info!(
            task_id = %task.id,
            content_id = %task.destination.content_id,
            version = %task.destination.version,
            "task created"
        );
        self.publish(&task);
        self.wake.notify_one();
        Ok(task)
    }

    pub async fn get(&self, id: &str) -> Result<DownloadTask, ManagerError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))
    }

    /// All tasks, most recent first.
    pub async fn list(&self) -> Result<Vec<DownloadTask>, ManagerError> {
        let mut tasks = self.store.list().await?;
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    pub async fn list_for_accounts(&self, account_hashes: &[String]) -> Result<Vec<DownloadTask>, ManagerError> {
        let mut tasks = self.list().await?;
        tasks.retain(|t| account_hashes.contains(&t.destination.account_hash));
        Ok(tasks)
    }

    /// Completed tasks of the given accounts whose artifact is still on disk.
    pub async fn packages(&self, account_hashes: &[String]) -> Result<Vec<PackageInfo>, ManagerError> {
        let mut packages = Vec::new();
        for task in self.list_for_accounts(account_hashes).await? {
            if task.status != TaskStatus::Completed {
                continue;
            }
            if let Ok(meta) = tokio::fs::metadata(&task.destination_path).await {
                packages.push(PackageInfo {
                    file_size: meta.len(),
                    task,
                });
            }
        }
        Ok(packages)
    }

    /// Stops a pending or downloading task. Part-files stay on disk for a
    /// later `resume`. A no-op in any other status.
    pub async fn pause(&self, id: &str) -> Result<DownloadTask, ManagerError> {
        let task = self
            .store
            .update(
                id,
                Box::new(|t| {
                    if matches!(t.status, TaskStatus::Pending | TaskStatus::Downloading) {
                        t.set_status(TaskStatus::Paused);
                    }
                }),
            )
            .await?
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;

        if let Some(run) = self.runs.lock().await.get(id) {
            run.token.cancel();
        }
        info!(task_id = %id, status = %task.status, "pause requested");
        self.publish(&task);
        Ok(task)
    }

    /// Puts a paused or failed task back in the queue. The pool promotes it to
    /// `downloading` once a slot is free.
    pub async fn resume(&self, id: &str) -> Result<DownloadTask, ManagerError> {
        let current = self.get(id).await?;
        if !matches!(current.status, TaskStatus::Paused | TaskStatus::Failed) {
            return Err(ManagerError::InvalidState {
                id: id.to_string(),
                status: current.status,
                action: "resume",
            });
        }

        let task = self
            .store
            .update(
                id,
                Box::new(|t| {
                    if matches!(t.status, TaskStatus::Paused | TaskStatus::Failed) {
                        t.set_status(TaskStatus::Pending);
                    }
                }),
            )
            .await?
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;

        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Downloading) {
            return Err(ManagerError::InvalidState {
                id: id.to_string(),
                status: task.status,
                action: "resume",
            });
        }
        info!(task_id = %id, "task queued for resume");
        self.publish(&task);
        self.wake.notify_one();
        Ok(task)
    }

    /// Removes the task and every file it owns, whatever its status.
    /// Deleting an unknown id succeeds.
    pub async fn delete(&self, id: &str) -> Result<(), ManagerError> {
        let task = self.store.get(id).await?;
        self.store.delete(id).await?;

        let run = self.runs.lock().await.remove(id);
        if let Some(run) = run {
            run.token.cancel();
            if let Err(e) = run.handle.await {
                warn!(task_id = %id, error = %e, "worker ended abnormally during delete");
            }
        }

        if let Some(task) = task {
            remove_artifact(&task.destination_path).await;
            let parts = cleanup_parts(&task.destination_path).await;
            info!(task_id = %id, parts_removed = parts, "task deleted");
            let _ = self.events.send(TaskEvent::Removed {
                id: task.id,
                account_hash: task.destination.account_hash,
            });
        }
        self.wake.notify_one();
        Ok(())
    }

    /// Deletes the artifact of a completed task. The record stays and reads
    /// as completed without a file.
    pub async fn remove_package(&self, id: &str) -> Result<DownloadTask, ManagerError> {
        let task = self.get(id).await?;
        if task.status != TaskStatus::Completed {
            return Err(ManagerError::InvalidState {
                id: id.to_string(),
                status: task.status,
                action: "remove the package of",
            });
        }
        remove_artifact(&task.destination_path).await;
        info!(task_id = %id, "package removed");
        let _ = self.events.send(TaskEvent::Updated {
            task: task.sanitize(false),
        });
        Ok(task)
    }

    /// Stores an already-built artifact as a completed task.
    ///
    /// The body is streamed to disk while counting bytes; the upload is
    /// aborted and its partial file deleted as soon as it passes the
    /// configured maximum.
    pub async fn import_upload<S, E>(
        &self,
        destination: DestinationSpec,
        content_type: Option<&str>,
        declared_len: Option<u64>,
        body: S,
    ) -> Result<DownloadTask, UploadError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        check_content_type(content_type)?;
        validate_destination(&destination).map_err(|e| UploadError::InvalidInput(e.to_string()))?;

        let limit = self.config.max_download_size;
        if let Some(size) = declared_len.filter(|size| *size > limit) {
            return Err(UploadError::TooLarge { size, limit });
        }

        let id = Uuid::new_v4().to_string();
        let path = artifact_path(
            &self.config.packages_dir,
            &destination,
            &id,
            &self.config.artifact_extension,
        )
        .map_err(|e| UploadError::InvalidInput(e.to_string()))?;

        let received = receive_upload(&path, limit, body).await?;

        let mut task = DownloadTask::new(id, String::new(), destination, path, 1);
        task.total_bytes = received;
        task.downloaded_bytes = received;
        task.set_status(TaskStatus::Completed);
        if let Err(e) = self.store.create(&task).await {
            remove_artifact(&task.destination_path).await;
            return Err(e.into());
        }

        info!(task_id = %task.id, bytes = received, "upload stored as completed task");
        self.publish(&task);
        self.supersede_older(&task).await;
        Ok(task)
    }

    /// Scheduler loop. Keeps at most `max_concurrent_tasks` engine runs alive
    /// until `shutdown` fires, then stops every run.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            max_concurrent = self.config.max_concurrent_tasks,
            threads_per_task = self.config.threads_per_task,
            "task manager started"
        );
        let mut tick = tokio::time::interval(SCHEDULER_TICK);
        loop {
            if let Err(e) = self.schedule().await {
                error!(error = %e, "scheduling pass failed");
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tick.tick() => {}
            }
        }
        self.stop_all().await;
        info!("task manager stopped");
    }

    async fn schedule(self: &Arc<Self>) -> Result<(), ManagerError> {
        let mut pending: Vec<_> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        pending.sort_by_key(|t| t.created_at);

        let mut runs = self.runs.lock().await;
        let free = self.config.max_concurrent_tasks.saturating_sub(runs.len());
        let startable: Vec<_> = pending
            .into_iter()
            .filter(|t| !runs.contains_key(&t.id))
            .take(free)
            .collect();

        for task in startable {
            let token = CancellationToken::new();
            let handle = tokio::spawn(Arc::clone(self).run_task(task.id.clone(), token.clone()));
            debug!(task_id = %task.id, "worker spawned");
            runs.insert(task.id, ActiveRun { token, handle });
        }
        Ok(())
    }

    async fn stop_all(&self) {
        let runs: Vec<_> = self.runs.lock().await.drain().collect();
        for (_, run) in &runs {
            run.token.cancel();
        }
        for (id, run) in runs {
            if let Err(e) = run.handle.await {
                warn!(task_id = %id, error = %e, "worker ended abnormally during shutdown");
            }
        }
    }

    /// One engine run for one task.
    ///
    /// The byte count restarts from zero with the run; the engine's first
    /// sample then raises it to whatever part data is still usable on disk.
    async fn run_task(self: Arc<Self>, id: TaskId, token: CancellationToken) {
        let started = self
            .store
            .update(
                &id,
                Box::new(|t| {
                    if t.status == TaskStatus::Pending {
                        t.downloaded_bytes = 0;
                        t.set_status(TaskStatus::Downloading);
                    }
                }),
            )
            .await;

        match started {
            Ok(Some(task)) if task.status == TaskStatus::Downloading => {
                self.publish(&task);
                self.drive(task, &token).await;
            }
            Ok(_) => debug!(task_id = %id, "task left the queue before its run started"),
            Err(e) => error!(task_id = %id, error = %e, "failed to start task"),
        }

        self.runs.lock().await.remove(&id);
        self.wake.notify_one();
    }

    async fn drive(self: &Arc<Self>, task: DownloadTask, token: &CancellationToken) {
        let id = task.id.clone();
        info!(task_id = %id, threads = task.threads, "download started");

        let mut request = DownloadRequest::new(task.url.clone(), task.destination_path.clone(), task.threads);
        request.size_hint = task.expected_max_size;
        request.previous_total = (task.total_bytes > 0).then_some(task.total_bytes);
        request.expected_sha256 = task.expected_sha256.clone();

        let (progress_tx, progress_rx) = watch::channel(DownloadProgress {
            downloaded: task.downloaded_bytes,
            total: task.total_bytes,
            speed: 0,
        });
        let persister = tokio::spawn(Arc::clone(self).persist_progress(id.clone(), progress_rx));
        let on_progress: ProgressCallback = Arc::new(move |p| {
            progress_tx.send_replace(p);
        });

        let result = self.downloader.download(&request, token, on_progress).await;
        if let Err(e) = persister.await {
            warn!(task_id = %id, error = %e, "progress persister ended abnormally");
        }

        let finished = match result {
            Ok(outcome) => {
                self.store
                    .update(
                        &id,
                        Box::new(move |t| {
                            t.total_bytes = outcome.total_bytes;
                            t.downloaded_bytes = outcome.total_bytes;
                            t.set_status(TaskStatus::Completed);
                        }),
                    )
                    .await
            }
            Err(e) if e.is_cancelled() => {
                // Pause and delete have already moved the record; only a
                // shutdown leaves it downloading.
                self.store
                    .update(
                        &id,
                        Box::new(|t| {
                            if t.status == TaskStatus::Downloading {
                                t.set_status(TaskStatus::Paused);
                            }
                        }),
                    )
                    .await
            }
            Err(e) => {
                let reason = e.to_string();
                error!(task_id = %id, error = %reason, "download failed");
                self.store
                    .update(
                        &id,
                        Box::new(move |t| {
                            if t.status == TaskStatus::Downloading {
                                t.fail(reason);
                            }
                        }),
                    )
                    .await
            }
        };

        match finished {
            Ok(Some(task)) => {
                info!(task_id = %id, status = %task.status, "run finished");
                self.publish(&task);
                if task.status == TaskStatus::Completed {
                    self.supersede_older(&task).await;
                }
            }
            Ok(None) => debug!(task_id = %id, "task deleted during its run"),
            Err(e) => error!(task_id = %id, error = %e, "failed to record run outcome"),
        }
    }

    /// Writes progress samples into the store until the engine drops its
    /// callback. Only a downloading record is touched.
    async fn persist_progress(self: Arc<Self>, id: TaskId, mut rx: watch::Receiver<DownloadProgress>) {
        while rx.changed().await.is_ok() {
            let sample = *rx.borrow_and_update();
            let updated = self
                .store
                .update(
                    &id,
                    Box::new(move |t| {
                        if t.status == TaskStatus::Downloading {
                            t.downloaded_bytes = sample.downloaded;
                            t.total_bytes = sample.total;
                            t.speed = sample.speed;
                            t.updated_at = Utc::now();
                        }
                    }),
                )
                .await;
            match updated {
                Ok(Some(task)) if task.status == TaskStatus::Downloading => self.publish(&task),
                Ok(_) => {}
                Err(e) => warn!(task_id = %id, error = %e, "failed to persist progress"),
            }
        }
    }

    /// Deletes older completed tasks for the same destination so the newest
    /// artifact wins.
    async fn supersede_older(&self, task: &DownloadTask) {
        let tasks = match self.store.list().await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "could not look for superseded tasks");
                return;
            }
        };
        for old in tasks.into_iter().filter(|t| {
            t.id != task.id
                && t.status == TaskStatus::Completed
                && t.destination == task.destination
                && t.created_at <= task.created_at
        }) {
            info!(task_id = %old.id, superseded_by = %task.id, "removing superseded task");
            if let Err(e) = self.delete(&old.id).await {
                warn!(task_id = %old.id, error = %e, "failed to remove superseded task");
            }
        }
    }

    fn publish(&self, task: &DownloadTask) {
        let view = task.sanitize(task.status == TaskStatus::Completed);
        let _ = self.events.send(TaskEvent::Updated { task: view });
    }
}

async fn remove_artifact(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove artifact");
        }
    }
}
