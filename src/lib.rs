pub mod api;
pub mod config;
pub mod downloader;
pub mod fetcher;
pub mod integrity;
pub mod manager;
pub mod merger;
pub mod models;
pub mod paths;
pub mod planner;
pub mod probe;
pub mod progress;
pub mod retry;
pub mod state_manager;
pub mod store;
pub mod upload;

/// Convenient re-exports of the types most callers need.
pub mod prelude {
    pub use crate::config::{Config, EngineConfig, ManagerConfig};
    pub use crate::downloader::{DownloadError, DownloadOutcome, DownloadRequest, Downloader, Strategy};
    pub use crate::manager::{ManagerError, TaskEvent, TaskManager};
    pub use crate::models::{CreateTaskRequest, DestinationSpec, DownloadProgress, DownloadTask, TaskStatus, TaskView};
    pub use crate::state_manager::SqliteTaskStore;
    pub use crate::store::{MemoryTaskStore, StoreError, TaskStore};
}
