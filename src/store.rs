// src/store.rs

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::models::{DownloadTask, TaskId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("task {0} already exists")]
    Duplicate(TaskId),
}

/// A change applied to one task record while its writer lock is held.
pub type TaskMutation = Box<dyn FnOnce(&mut DownloadTask) + Send>;

/// Durable record of every download task.
///
/// Implementations serialize `update` calls per task id, so a mutation always
/// sees the result of the previous one. Updates to different tasks may run
/// concurrently.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(&self, task: &DownloadTask) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<DownloadTask>, StoreError>;

    /// Applies `mutation` to the stored record and returns the result, or
    /// `None` if no task has this id.
    async fn update(&self, id: &str, mutation: TaskMutation) -> Result<Option<DownloadTask>, StoreError>;

    /// Returns whether a record was removed.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    async fn list(&self) -> Result<Vec<DownloadTask>, StoreError>;
}

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<HashMap<TaskId, Arc<Mutex<DownloadTask>>>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn record(&self, id: &str) -> Option<Arc<Mutex<DownloadTask>>> {
        self.tasks.lock().await.get(id).cloned()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(&self, task: &DownloadTask) -> Result<(), StoreError> {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&task.id) {
            return Err(StoreError::Duplicate(task.id.clone()));
        }
        tasks.insert(task.id.clone(), Arc::new(Mutex::new(task.clone())));
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<DownloadTask>, StoreError> {
        match self.record(id).await {
            Some(record) => Ok(Some(record.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn update(&self, id: &str, mutation: TaskMutation) -> Result<Option<DownloadTask>, StoreError> {
        let Some(record) = self.record(id).await else {
            return Ok(None);
        };
        let mut task = record.lock().await;
        mutation(&mut task);
        Ok(Some(task.clone()))
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.tasks.lock().await.remove(id).is_some())
    }

    async fn list(&self) -> Result<Vec<DownloadTask>, StoreError> {
        let records: Vec<_> = self.tasks.lock().await.values().cloned().collect();
        let mut result = Vec::with_capacity(records.len());
        for record in records {
            result.push(record.lock().await.clone());
        }
        Ok(result)
    }
}
