// src/state_manager.rs

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use tokio_rusqlite::Connection;

use crate::models::DownloadTask;
use crate::store::{StoreError, TaskMutation, TaskStore};

/// Persists download tasks to an SQLite database, one JSON document per row.
///
/// All statements run on the connection's single background thread, so a
/// read-modify-write inside one `call` cannot interleave with another writer.
pub struct SqliteTaskStore {
    conn: Connection,
}

impl SqliteTaskStore {
    /// Opens (or creates) the database file and its tables.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path).await?;
        let store = Self { conn };
        store.setup_database().await?;
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.setup_database().await?;
        Ok(store)
    }

    async fn setup_database(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS tasks (
                        id              TEXT PRIMARY KEY,
                        created_at      TEXT NOT NULL,
                        task_data       TEXT NOT NULL
                    )",
                    [],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

fn decode(task_data: &str) -> rusqlite::Result<DownloadTask> {
    serde_json::from_str(task_data)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(&self, task: &DownloadTask) -> Result<(), StoreError> {
        let task_data = serde_json::to_string(task)?;
        let id = task.id.clone();
        let created_at = task.created_at.to_rfc3339();

        let inserted = self
            .conn
            .call({
                let id = id.clone();
                move |conn| {
                    let rows = conn.execute(
                        "INSERT OR IGNORE INTO tasks (id, created_at, task_data) VALUES (?1, ?2, ?3)",
                        params![id, created_at, task_data],
                    )?;
                    Ok(rows)
                }
            })
            .await?;

        if inserted == 0 {
            return Err(StoreError::Duplicate(id));
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<DownloadTask>, StoreError> {
        let id = id.to_string();
        let task = self
            .conn
            .call(move |conn| {
                let task_data: Option<String> = conn
                    .query_row("SELECT task_data FROM tasks WHERE id = ?1", params![id], |row| row.get(0))
                    .optional()?;
                match task_data {
                    Some(data) => Ok(Some(decode(&data)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(task)
    }

    async fn update(&self, id: &str, mutation: TaskMutation) -> Result<Option<DownloadTask>, StoreError> {
        let id = id.to_string();
        let task = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let task_data: Option<String> = tx
                    .query_row("SELECT task_data FROM tasks WHERE id = ?1", params![id], |row| row.get(0))
                    .optional()?;
                let Some(data) = task_data else {
                    return Ok(None);
                };

                let mut task = decode(&data)?;
                mutation(&mut task);
                let encoded =
                    serde_json::to_string(&task).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                tx.execute("UPDATE tasks SET task_data = ?1 WHERE id = ?2", params![encoded, id])?;
                tx.commit()?;
                Ok(Some(task))
            })
            .await?;
        Ok(task)
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        let removed = self
            .conn
            .call(move |conn| {
                let rows = conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
                Ok(rows)
            })
            .await?;
        Ok(removed > 0)
    }

    async fn list(&self) -> Result<Vec<DownloadTask>, StoreError> {
        let tasks = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT task_data FROM tasks ORDER BY created_at")?;
                let task_iter = stmt.query_map([], |row| {
                    let task_data: String = row.get(0)?;
                    decode(&task_data)
                })?;
                let tasks: Result<Vec<DownloadTask>, rusqlite::Error> = task_iter.collect();
                Ok(tasks?)
            })
            .await?;
        Ok(tasks)
    }
}
