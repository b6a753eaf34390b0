//! Local origin server for integration tests.
//!
//! Serves one in-memory resource under several behaviours:
//! - `/file`: HEAD + GET with byte-range support
//! - `/plain`: no range support, GET always answers 200 with the whole body
//! - `/slow`: like `/file` but drips the body out in small delayed pieces
//! - `/flaky`: like `/file` but the next N ranged GETs answer 503
//! - `/unbounded`: no size on HEAD, GET streams without `content-length`
//! - `/shifted`: answers a range request with a neighbouring slice of the
//!   same length and a `Content-Range` that says so

#![allow(dead_code)]

use axum::body::Body;
use axum::extract::State;
use axum::http::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use odm::config::EngineConfig;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct OriginState {
    data: Bytes,
    piece: usize,
    delay: Duration,
    gets: AtomicUsize,
    failures_left: AtomicUsize,
    ranges: Mutex<Vec<(String, String)>>,
}

pub struct Origin {
    pub addr: SocketAddr,
    state: Arc<OriginState>,
}

impl Origin {
    pub async fn start(data: Vec<u8>) -> Self {
        Self::start_with(data, 4 * 1024, Duration::from_millis(10)).await
    }

    /// `piece` and `delay` shape how `/slow` drips its body.
    pub async fn start_with(data: Vec<u8>, piece: usize, delay: Duration) -> Self {
        let state = Arc::new(OriginState {
            data: Bytes::from(data),
            piece: piece.max(1),
            delay,
            gets: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
            ranges: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/file", get(ranged).head(head_ranged))
            .route("/plain", get(plain).head(head_plain))
            .route("/slow", get(slow).head(head_ranged))
            .route("/flaky", get(flaky).head(head_ranged))
            .route("/unbounded", get(unbounded).head(head_unknown))
            .route("/shifted", get(shifted).head(head_ranged))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Number of GET requests served so far, on any route.
    pub fn gets(&self) -> usize {
        self.state.gets.load(Ordering::SeqCst)
    }

    /// `Range` headers received, as `(route, header)` pairs.
    pub fn ranges(&self, route: &str) -> Vec<String> {
        self.state
            .ranges
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| r == route)
            .map(|(_, h)| h.clone())
            .collect()
    }

    pub fn fail_next(&self, n: usize) {
        self.state.failures_left.store(n, Ordering::SeqCst);
    }
}

/// Deterministic, non-repeating-looking test payload.
pub fn payload(len: usize) -> Vec<u8> {
    let mut x: u32 = 0x9e37_79b9;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            (x >> 24) as u8
        })
        .collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    format!("{:x}", Sha256::digest(data))
}

pub fn engine_config() -> EngineConfig {
    EngineConfig {
        max_download_size: 64 * 1024 * 1024,
        request_timeout: Duration::from_secs(30),
        connect_timeout: Duration::from_secs(5),
        chunk_retries: 3,
        retry_delay: Duration::from_millis(20),
        progress_interval: Duration::from_millis(25),
        user_agent: "odm-tests".into(),
    }
}

/// Names of every part-file in `dir`.
pub fn part_files(dir: &std::path::Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(".part"))
        .collect()
}

fn parse_range(headers: &HeaderMap, len: usize) -> Option<(usize, usize)> {
    let value = headers.get(RANGE)?.to_str().ok()?;
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: usize = start.parse().ok()?;
    let end: usize = if end.is_empty() { len.checked_sub(1)? } else { end.parse().ok()? };
    if start > end || end >= len {
        return None;
    }
    Some((start, end))
}

fn record(state: &OriginState, route: &str, headers: &HeaderMap) {
    state.gets.fetch_add(1, Ordering::SeqCst);
    if let Some(value) = headers.get(RANGE).and_then(|v| v.to_str().ok()) {
        state
            .ranges
            .lock()
            .unwrap()
            .push((route.to_string(), value.to_string()));
    }
}

fn dripping(data: Bytes, piece: usize, delay: Duration) -> Body {
    let stream = futures_util::stream::unfold(0usize, move |offset| {
        let data = data.clone();
        async move {
            if offset >= data.len() {
                return None;
            }
            tokio::time::sleep(delay).await;
            let end = (offset + piece).min(data.len());
            Some((Ok::<Bytes, std::io::Error>(data.slice(offset..end)), end))
        }
    });
    Body::from_stream(stream)
}

fn ranged_response(state: &OriginState, headers: &HeaderMap, drip: bool) -> Response {
    let len = state.data.len();
    let (status, slice, content_range) = match parse_range(headers, len) {
        Some((start, end)) => (
            StatusCode::PARTIAL_CONTENT,
            state.data.slice(start..=end),
            Some(format!("bytes {start}-{end}/{len}")),
        ),
        None => (StatusCode::OK, state.data.clone(), None),
    };

    let size = slice.len();
    let body = if drip {
        dripping(slice, state.piece, state.delay)
    } else {
        Body::from(slice)
    };
    let mut response = (status, body).into_response();
    let h = response.headers_mut();
    h.insert(ACCEPT_RANGES, "bytes".parse().unwrap());
    h.insert(CONTENT_LENGTH, size.into());
    if let Some(value) = content_range {
        h.insert(CONTENT_RANGE, value.parse().unwrap());
    }
    response
}

async fn head_ranged(State(state): State<Arc<OriginState>>) -> impl IntoResponse {
    [
        (CONTENT_LENGTH, state.data.len().to_string()),
        (ACCEPT_RANGES, "bytes".to_string()),
    ]
}

async fn head_plain(State(state): State<Arc<OriginState>>) -> impl IntoResponse {
    [(CONTENT_LENGTH, state.data.len().to_string())]
}

async fn head_unknown() -> StatusCode {
    StatusCode::OK
}

async fn ranged(State(state): State<Arc<OriginState>>, headers: HeaderMap) -> Response {
    record(&state, "/file", &headers);
    ranged_response(&state, &headers, false)
}

async fn plain(State(state): State<Arc<OriginState>>, headers: HeaderMap) -> Response {
    record(&state, "/plain", &headers);
    (StatusCode::OK, state.data.clone()).into_response()
}

async fn slow(State(state): State<Arc<OriginState>>, headers: HeaderMap) -> Response {
    record(&state, "/slow", &headers);
    ranged_response(&state, &headers, true)
}

async fn flaky(State(state): State<Arc<OriginState>>, headers: HeaderMap) -> Response {
    record(&state, "/flaky", &headers);
    let failed = state
        .failures_left
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failed {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ranged_response(&state, &headers, false)
}

async fn unbounded(State(state): State<Arc<OriginState>>, headers: HeaderMap) -> Response {
    record(&state, "/unbounded", &headers);
    let body = dripping(state.data.clone(), state.piece, Duration::ZERO);
    (StatusCode::OK, body).into_response()
}

async fn shifted(State(state): State<Arc<OriginState>>, headers: HeaderMap) -> Response {
    record(&state, "/shifted", &headers);
    let len = state.data.len();
    let Some((start, end)) = parse_range(&headers, len) else {
        return (StatusCode::OK, state.data.clone()).into_response();
    };
    let (start, end) = if end + 1 < len {
        (start + 1, end + 1)
    } else if start > 0 {
        (start - 1, end - 1)
    } else {
        (start, end)
    };

    let slice = state.data.slice(start..=end);
    let size = slice.len();
    let mut response = (StatusCode::PARTIAL_CONTENT, Body::from(slice)).into_response();
    let h = response.headers_mut();
    h.insert(CONTENT_LENGTH, size.into());
    h.insert(CONTENT_RANGE, format!("bytes {start}-{end}/{len}").parse().unwrap());
    response
}
