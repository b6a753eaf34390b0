//! HTTP surface over the task manager.
//!
//! Polling clients list, inspect, pause, resume and delete tasks. Every
//! per-task route takes the caller's `accountHash` and refuses access to
//! tasks owned by another account. `/events` pushes the same updates as
//! server-sent events.

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, error};

use crate::manager::{ManagerError, TaskEvent, TaskManager};
use crate::models::{CreateTaskRequest, DestinationSpec, DownloadTask, TaskStatus, TaskView};
use crate::paths::sanitize_filename;
use crate::upload::{UploadError, UPLOAD_CONTENT_TYPE};

pub const ACCOUNT_HASH_HEADER: &str = "x-account-hash";
pub const CONTENT_ID_HEADER: &str = "x-content-id";
pub const VERSION_HEADER: &str = "x-version";

pub type AppState = Arc<TaskManager>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("access denied")]
    Forbidden,
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error("{0}")]
    UnsupportedMediaType(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::Internal(msg) => {
                error!(error = %msg, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<ManagerError> for ApiError {
    fn from(err: ManagerError) -> Self {
        match err {
            ManagerError::NotFound(_) => ApiError::NotFound(err.to_string()),
            ManagerError::InvalidState { .. } | ManagerError::Conflict { .. } => ApiError::Conflict(err.to_string()),
            ManagerError::Validation(_) | ManagerError::Digest(_) => ApiError::BadRequest(err.to_string()),
            ManagerError::Store(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        match err.status_code() {
            413 => ApiError::PayloadTooLarge(err.to_string()),
            415 => ApiError::UnsupportedMediaType(err.to_string()),
            400 => ApiError::BadRequest(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountsQuery {
    #[serde(default)]
    account_hashes: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountQuery {
    #[serde(default)]
    account_hash: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PackageView {
    id: String,
    account_hash: String,
    content_id: String,
    version: String,
    file_size: u64,
    created_at: DateTime<Utc>,
}

pub fn router(manager: AppState) -> Router {
    Router::new()
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/:id", get(get_task).delete(delete_task))
        .route("/tasks/:id/pause", post(pause_task))
        .route("/tasks/:id/resume", post(resume_task))
        .route("/uploads", post(upload).layer(DefaultBodyLimit::disable()))
        .route("/packages", get(list_packages))
        .route("/packages/:id", delete(delete_package))
        .route("/packages/:id/file", get(download_package))
        .route("/events", get(events))
        .with_state(manager)
}

fn split_hashes(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

async fn view(task: &DownloadTask) -> TaskView {
    let has_file = task.status == TaskStatus::Completed
        && tokio::fs::try_exists(&task.destination_path).await.unwrap_or(false);
    task.sanitize(has_file)
}

/// Loads `id` on behalf of `account_hash`.
async fn owned_task(manager: &TaskManager, id: &str, account_hash: &str) -> Result<DownloadTask, ApiError> {
    if account_hash.len() < 8 {
        return Err(ApiError::BadRequest("missing or invalid accountHash".into()));
    }
    let task = manager.get(id).await?;
    if task.destination.account_hash != account_hash {
        return Err(ApiError::Forbidden);
    }
    Ok(task)
}

async fn list_tasks(
    State(manager): State<AppState>,
    Query(query): Query<AccountsQuery>,
) -> Result<Json<Vec<TaskView>>, ApiError> {
    let hashes = split_hashes(&query.account_hashes);
    if hashes.is_empty() {
        return Ok(Json(Vec::new()));
    }
    let tasks = manager.list_for_accounts(&hashes).await?;
    let mut views = Vec::with_capacity(tasks.len());
    for task in &tasks {
        views.push(view(task).await);
    }
    Ok(Json(views))
}

async fn create_task(
    State(manager): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<TaskView>), ApiError> {
    let task = manager.create(request).await?;
    Ok((StatusCode::CREATED, Json(view(&task).await)))
}

async fn get_task(
    State(manager): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<AccountQuery>,
) -> Result<Json<TaskView>, ApiError> {
    let task = owned_task(&manager, &id, &query.account_hash).await?;
    Ok(Json(view(&task).await))
}

async fn pause_task(
    State(manager): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<AccountQuery>,
) -> Result<Json<TaskView>, ApiError> {
    owned_task(&manager, &id, &query.account_hash).await?;
    let task = manager.pause(&id).await?;
    Ok(Json(view(&task).await))
}

async fn resume_task(
    State(manager): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<AccountQuery>,
) -> Result<Json<TaskView>, ApiError> {
    owned_task(&manager, &id, &query.account_hash).await?;
    let task = manager.resume(&id).await?;
    Ok(Json(view(&task).await))
}

async fn delete_task(
    State(manager): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<AccountQuery>,
) -> Result<StatusCode, ApiError> {
    match owned_task(&manager, &id, &query.account_hash).await {
        Ok(_) | Err(ApiError::NotFound(_)) => {}
        Err(e) => return Err(e),
    }
    manager.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn upload(
    State(manager): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<(StatusCode, Json<TaskView>), ApiError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .unwrap_or_default()
    };
    let destination = DestinationSpec {
        account_hash: header(ACCOUNT_HASH_HEADER),
        content_id: header(CONTENT_ID_HEADER),
        version: header(VERSION_HEADER),
    };
    let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
    let declared_len = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let task = manager
        .import_upload(destination, content_type, declared_len, Box::pin(body.into_data_stream()))
        .await?;
    Ok((StatusCode::CREATED, Json(view(&task).await)))
}

async fn list_packages(
    State(manager): State<AppState>,
    Query(query): Query<AccountsQuery>,
) -> Result<Json<Vec<PackageView>>, ApiError> {
    let hashes = split_hashes(&query.account_hashes);
    if hashes.is_empty() {
        return Ok(Json(Vec::new()));
    }
    let packages = manager
        .packages(&hashes)
        .await?
        .into_iter()
        .map(|p| PackageView {
            id: p.task.id,
            account_hash: p.task.destination.account_hash,
            content_id: p.task.destination.content_id,
            version: p.task.destination.version,
            file_size: p.file_size,
            created_at: p.task.created_at,
        })
        .collect();
    Ok(Json(packages))
}

async fn download_package(
    State(manager): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<AccountQuery>,
) -> Result<Response, ApiError> {
    let task = owned_task(&manager, &id, &query.account_hash).await?;
    if task.status != TaskStatus::Completed {
        return Err(ApiError::NotFound("package not found".into()));
    }
    let file = tokio::fs::File::open(&task.destination_path)
        .await
        .map_err(|_| ApiError::NotFound("package not found".into()))?;
    let size = file
        .metadata()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .len();

    let filename = sanitize_filename(&format!(
        "{}_{}.{}",
        task.destination.content_id,
        task.destination.version,
        manager.config().artifact_extension
    ));
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\""))
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(UPLOAD_CONTENT_TYPE));
    headers.insert(CONTENT_DISPOSITION, disposition);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(size));
    Ok(response)
}

async fn delete_package(
    State(manager): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<AccountQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let task = owned_task(&manager, &id, &query.account_hash).await?;
    if task.status != TaskStatus::Completed {
        return Err(ApiError::NotFound("package not found".into()));
    }
    manager.remove_package(&id).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

/// Server-sent task events for the given accounts.
async fn events(
    State(manager): State<AppState>,
    Query(query): Query<AccountsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static> {
    let hashes = split_hashes(&query.account_hashes);
    let stream = BroadcastStream::new(manager.subscribe()).filter_map(move |received| match received {
        Ok(event) => {
            let owner = match &event {
                TaskEvent::Updated { task } => &task.account_hash,
                TaskEvent::Removed { account_hash, .. } => account_hash,
            };
            if !hashes.contains(owner) {
                return None;
            }
            serde_json::to_string(&event)
                .ok()
                .map(|json| Ok(Event::default().data(json)))
        }
        Err(e) => {
            debug!(error = %e, "event subscriber lagged");
            None
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(30)).text("ping"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, EngineConfig};
    use crate::downloader::Downloader;
    use crate::store::MemoryTaskStore;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const ACCOUNT: &str = "abcdef1234567890";

    async fn app(dir: &TempDir, max_size: u64) -> (Router, AppState) {
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        config.max_download_size = max_size;
        let downloader = Downloader::new(EngineConfig::default()).unwrap();
        let manager = Arc::new(
            TaskManager::new(Arc::new(MemoryTaskStore::new()), downloader, config.manager())
                .await
                .unwrap(),
        );
        (router(manager.clone()), manager)
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn create_body(content_id: &str) -> Body {
        Body::from(
            serde_json::json!({
                "url": "http://127.0.0.1:9/app.ipa",
                "destinationSpec": {
                    "accountHash": ACCOUNT,
                    "contentId": content_id,
                    "version": "1.0"
                }
            })
            .to_string(),
        )
    }

    fn post_json(uri: &str, body: Body) -> Request<Body> {
        Request::post(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .unwrap()
    }

    #[tokio::test]
    async fn create_then_conflict() {
        let dir = TempDir::new().unwrap();
        let (app, _) = app(&dir, 1024).await;

        let response = app.clone().oneshot(post_json("/tasks", create_body("com.example.app"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = json_body(response).await;
        assert_eq!(created["status"], "pending");
        assert!(created.get("url").is_none());

        let response = app.oneshot(post_json("/tasks", create_body("com.example.app"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(json_body(response).await["error"].is_string());
    }

    #[tokio::test]
    async fn per_task_routes_check_the_account() {
        let dir = TempDir::new().unwrap();
        let (app, manager) = app(&dir, 1024).await;
        let task = manager
            .create(serde_json::from_value(serde_json::json!({
                "url": "http://127.0.0.1:9/app.ipa",
                "destinationSpec": {"accountHash": ACCOUNT, "contentId": "com.a", "version": "1"}
            })).unwrap())
            .await
            .unwrap();

        let uri = |hash: &str| format!("/tasks/{}?accountHash={hash}", task.id);
        let get = |uri: String| Request::get(uri).body(Body::empty()).unwrap();

        assert_eq!(app.clone().oneshot(get(uri(ACCOUNT))).await.unwrap().status(), StatusCode::OK);
        assert_eq!(app.clone().oneshot(get(uri("short"))).await.unwrap().status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            app.clone().oneshot(get(uri("ffffffffffffffff"))).await.unwrap().status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            app.clone()
                .oneshot(get(format!("/tasks/missing?accountHash={ACCOUNT}")))
                .await
                .unwrap()
                .status(),
            StatusCode::NOT_FOUND
        );

        let pause = Request::post(format!("/tasks/{}/pause?accountHash={ACCOUNT}", task.id))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(pause).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "paused");

        let delete = |uri: String| Request::delete(uri).body(Body::empty()).unwrap();
        assert_eq!(app.clone().oneshot(delete(uri(ACCOUNT))).await.unwrap().status(), StatusCode::NO_CONTENT);
        assert_eq!(app.oneshot(delete(uri(ACCOUNT))).await.unwrap().status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn resume_of_pending_task_is_a_conflict() {
        let dir = TempDir::new().unwrap();
        let (app, _) = app(&dir, 1024).await;
        let created = json_body(app.clone().oneshot(post_json("/tasks", create_body("com.b"))).await.unwrap()).await;
        let id = created["id"].as_str().unwrap();

        let resume = Request::post(format!("/tasks/{id}/resume?accountHash={ACCOUNT}"))
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.oneshot(resume).await.unwrap().status(), StatusCode::CONFLICT);
    }

    fn upload_request(content_type: &str, body: Vec<u8>, content_id: &str) -> Request<Body> {
        Request::post("/uploads")
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, body.len())
            .header(ACCOUNT_HASH_HEADER, ACCOUNT)
            .header(CONTENT_ID_HEADER, content_id)
            .header(VERSION_HEADER, "1.0")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn upload_status_codes() {
        let dir = TempDir::new().unwrap();
        let (app, _) = app(&dir, 16).await;

        let response = app
            .clone()
            .oneshot(upload_request(UPLOAD_CONTENT_TYPE, vec![1u8; 32], "com.big"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let response = app
            .clone()
            .oneshot(upload_request("text/plain", vec![1u8; 4], "com.text"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let response = app
            .clone()
            .oneshot(upload_request(UPLOAD_CONTENT_TYPE, vec![1u8; 4], "../etc"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(upload_request(UPLOAD_CONTENT_TYPE, vec![7u8; 8], "com.ok"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let task = json_body(response).await;
        assert_eq!(task["status"], "completed");
        assert_eq!(task["hasFile"], true);
        assert_eq!(task["totalBytes"], 8);

        let id = task["id"].as_str().unwrap();
        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/packages/{id}/file?accountHash={ACCOUNT}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[CONTENT_DISPOSITION],
            "attachment; filename=\"com.ok_1.0.ipa\""
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], &[7u8; 8]);

        let packages = json_body(
            app.oneshot(
                Request::get(format!("/packages?accountHashes={ACCOUNT}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap(),
        )
        .await;
        assert_eq!(packages.as_array().unwrap().len(), 1);
        assert_eq!(packages[0]["fileSize"], 8);
    }

    #[tokio::test]
    async fn package_delete_checks_the_account_and_removes_the_file() {
        let dir = TempDir::new().unwrap();
        let (app, manager) = app(&dir, 1024).await;
        let response = app
            .clone()
            .oneshot(upload_request(UPLOAD_CONTENT_TYPE, vec![3u8; 8], "com.signed"))
            .await
            .unwrap();
        let id = json_body(response).await["id"].as_str().unwrap().to_string();
        let path = manager.get(&id).await.unwrap().destination_path;
        assert!(path.exists());

        let delete = |uri: String| Request::delete(uri).body(Body::empty()).unwrap();
        let status = |response: Response| response.status();
        assert_eq!(
            status(app.clone().oneshot(delete(format!("/packages/{id}?accountHash=short"))).await.unwrap()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(app.clone().oneshot(delete(format!("/packages/{id}?accountHash=ffffffffffffffff"))).await.unwrap()),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status(app.clone().oneshot(delete(format!("/packages/missing?accountHash={ACCOUNT}"))).await.unwrap()),
            StatusCode::NOT_FOUND
        );
        assert!(path.exists());

        let response = app
            .clone()
            .oneshot(delete(format!("/packages/{id}?accountHash={ACCOUNT}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["success"], true);
        assert!(!path.exists());

        let file = Request::get(format!("/packages/{id}/file?accountHash={ACCOUNT}"))
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.clone().oneshot(file).await.unwrap().status(), StatusCode::NOT_FOUND);

        let task = json_body(
            app.oneshot(
                Request::get(format!("/tasks/{id}?accountHash={ACCOUNT}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap(),
        )
        .await;
        assert_eq!(task["status"], "completed");
        assert!(task.get("hasFile").is_none());
        assert!(manager.packages(&[ACCOUNT.to_string()]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn listing_without_accounts_is_empty() {
        let dir = TempDir::new().unwrap();
        let (app, _) = app(&dir, 1024).await;
        app.clone().oneshot(post_json("/tasks", create_body("com.c"))).await.unwrap();

        let all = json_body(app.clone().oneshot(Request::get("/tasks").body(Body::empty()).unwrap()).await.unwrap()).await;
        assert!(all.as_array().unwrap().is_empty());

        let mine = json_body(
            app.oneshot(
                Request::get(format!("/tasks?accountHashes={ACCOUNT}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap(),
        )
        .await;
        assert_eq!(mine.as_array().unwrap().len(), 1);
    }
}
