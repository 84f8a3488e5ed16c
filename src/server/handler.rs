// Axum request handler — routes asset requests to the cache engine and serves static files.

use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::any,
    Json, Router,
};
use serde_json::json;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::config::{
    decode_request_path, normalize_relative_path, AssetDescriptor, ASSET_CACHE_CONTROL,
};
use crate::detect::content_type::content_type_for;
use crate::engine::cache::is_temp_path;
use crate::engine::store::{AssetBody, AssetStore};

#[derive(Clone)]
pub struct AppState {
    store: Arc<AssetStore>,
    static_dir: Arc<PathBuf>,
}

impl AppState {
    pub fn new(store: Arc<AssetStore>, static_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            static_dir: Arc::new(static_dir.into()),
        }
    }

    pub fn store(&self) -> &Arc<AssetStore> {
        &self.store
    }
}

/// Build the application router.
///
/// `/api` is reserved for the game API and never falls through to file serving.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api", any(api_not_found))
        .route("/api/{*rest}", any(api_not_found))
        .fallback(serve_path)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub struct AssetServer {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl AssetServer {
    /// Bind `bind_addr` (e.g. `127.0.0.1:0`) and serve in the background.
    pub async fn start(bind_addr: &str, state: AppState) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind {}", bind_addr))?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = router(state);

        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                error!("asset server stopped: {}", e);
            }
        });

        info!("asset server listening on {}", addr);
        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Build a URL for `path` on this server.
    pub fn url_for(&self, path: &str) -> String {
        format!("http://{}/{}", self.addr, path.trim_start_matches('/'))
    }

    /// Stop accepting connections and wait for in-flight responses to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn api_not_found(uri: Uri) -> Response {
    debug!("api route not served here: {}", uri.path());
    error_response(StatusCode::NOT_FOUND, "not found")
}

async fn serve_path(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    if method == Method::OPTIONS {
        return StatusCode::NO_CONTENT.into_response();
    }
    if method != Method::GET && method != Method::HEAD {
        return (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed").into_response();
    }

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range_header);

    let Some(path) = decode_request_path(uri.path()) else {
        return not_found();
    };
    // `/api%2Ftts` must not reach the file system either.
    if path == "/api" || path.starts_with("/api/") {
        return error_response(StatusCode::NOT_FOUND, "not found");
    }

    let asset = state.store.manifest().get(&path).cloned();
    match asset {
        Some(asset) => serve_asset(&state.store, &asset, range).await,
        None => serve_static(&state.static_dir, &path, range).await,
    }
}

/// Serve a manifest asset from the cache, downloading it on a miss.
async fn serve_asset(
    store: &Arc<AssetStore>,
    asset: &AssetDescriptor,
    range: Option<ParsedRange>,
) -> Response {
    let content_type = content_type_for(&asset.relative_path);

    match store.open(asset).await {
        Ok(AssetBody::Cached { path, len }) => {
            debug!("asset {} served from cache", asset.relative_path);
            file_response(&path, len, content_type, range, Some(ASSET_CACHE_CONTROL)).await
        }
        Ok(AssetBody::Streaming {
            content_length,
            body,
        }) => {
            debug!(
                "asset {} streaming from origin content_length={:?}",
                asset.relative_path, content_length
            );
            let stream = futures_util::stream::unfold(body, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });

            let mut resp_headers = HeaderMap::new();
            resp_headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
            resp_headers.insert(
                header::CACHE_CONTROL,
                HeaderValue::from_static(ASSET_CACHE_CONTROL),
            );
            if let Some(len) = content_length {
                resp_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
            }

            (StatusCode::OK, resp_headers, Body::from_stream(stream)).into_response()
        }
        Err(e) => {
            warn!("asset {} unavailable: {}", asset.relative_path, e);
            error_response(e.status(), e.to_string())
        }
    }
}

/// Serve a plain file below the static root; `/` maps to `index.html`.
///
/// `request_path` is already percent-decoded. In-progress `*.tmp` downloads
/// are never served, even when the cache shares the static root.
async fn serve_static(root: &Path, request_path: &str, range: Option<ParsedRange>) -> Response {
    let relative = if request_path == "/" {
        Some("index.html".to_string())
    } else {
        normalize_relative_path(request_path)
    };
    let Some(relative) = relative else {
        return not_found();
    };
    if is_temp_path(Path::new(&relative)) {
        return not_found();
    }

    let path = root.join(&relative);
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => {
            file_response(&path, meta.len(), content_type_for(&relative), range, None).await
        }
        _ => not_found(),
    }
}

async fn file_response(
    path: &Path,
    total: u64,
    content_type: &'static str,
    range: Option<ParsedRange>,
    cache_control: Option<&'static str>,
) -> Response {
    let Some((start, end, is_partial)) = resolve_range(range, total) else {
        return (
            StatusCode::RANGE_NOT_SATISFIABLE,
            [(header::CONTENT_RANGE, format!("bytes */{}", total))],
            "range not satisfiable",
        )
            .into_response();
    };

    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return not_found(),
        Err(e) => {
            error!("open {} failed: {}", path.display(), e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to read file");
        }
    };
    if start > 0 {
        if let Err(e) = file.seek(SeekFrom::Start(start)).await {
            error!("seek {} to {} failed: {}", path.display(), start, e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to read file");
        }
    }

    let body_len = end - start;
    let body = Body::from_stream(ReaderStream::new(file.take(body_len)));

    let mut resp_headers = HeaderMap::new();
    resp_headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body_len));
    resp_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(cache_control) = cache_control {
        resp_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(cache_control));
    }

    let status = if is_partial {
        // Content-Range: bytes start-end/total (end is inclusive in HTTP).
        let content_range = format!("bytes {}-{}/{}", start, end - 1, total);
        if let Ok(value) = HeaderValue::from_str(&content_range) {
            resp_headers.insert(header::CONTENT_RANGE, value);
        }
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    (status, resp_headers, body).into_response()
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not found").into_response()
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParsedRange {
    StartEnd {
        start: u64,
        end_inclusive: Option<u64>,
    },
    Suffix {
        len: u64,
    },
}

/// Parse a Range header value.
/// Supports:
/// - bytes=start-end
/// - bytes=start-
/// - bytes=-suffix_len
fn parse_range_header(value: &str) -> Option<ParsedRange> {
    let value = value.trim();
    let rest = value.strip_prefix("bytes=")?;
    let mut parts = rest.splitn(2, '-');
    let start_str = parts.next()?.trim();
    let end_str = parts.next()?.trim();

    if start_str.is_empty() {
        let len: u64 = end_str.parse().ok()?;
        if len == 0 {
            return None;
        }
        Some(ParsedRange::Suffix { len })
    } else {
        let start: u64 = start_str.parse().ok()?;
        let end_inclusive = if end_str.is_empty() {
            None
        } else {
            Some(end_str.parse::<u64>().ok()?)
        };
        Some(ParsedRange::StartEnd {
            start,
            end_inclusive,
        })
    }
}

/// Turn a parsed range into `[start, end)` over a file of `total` bytes.
///
/// Returns `None` when the range cannot be satisfied.
fn resolve_range(range: Option<ParsedRange>, total: u64) -> Option<(u64, u64, bool)> {
    match range {
        None => Some((0, total, false)),
        Some(ParsedRange::StartEnd {
            start,
            end_inclusive: Some(end),
        }) => {
            if start >= total || end < start {
                return None;
            }
            Some((start, (end + 1).min(total), true))
        }
        Some(ParsedRange::StartEnd {
            start,
            end_inclusive: None,
        }) => {
            if start >= total {
                return None;
            }
            Some((start, total, true))
        }
        Some(ParsedRange::Suffix { len }) => {
            if total == 0 {
                return None;
            }
            Some((total.saturating_sub(len), total, true))
        }
    }
}
