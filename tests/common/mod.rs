// Fake origin server shared by the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpListener;

use pippin_asset_proxy::config::AssetManifest;
use pippin_asset_proxy::engine::cache::DiskCache;
use pippin_asset_proxy::engine::store::AssetStore;
use pippin_asset_proxy::source::http_source::HttpOrigin;

pub const MB: usize = 1024 * 1024;
const STREAM_CHUNK: usize = 64 * 1024;

/// Deterministic test content.
pub fn content(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

#[derive(Clone, Default)]
struct Hits(Arc<Mutex<HashMap<String, usize>>>);

impl Hits {
    fn record(&self, uri: &Uri) {
        *self.0.lock().entry(uri.path().to_string()).or_insert(0) += 1;
    }
}

pub struct Upstream {
    addr: SocketAddr,
    hits: Hits,
}

impl Upstream {
    /// Start a fake origin on a random port.
    ///
    /// Routes:
    /// - `/blob/{size}`: `size` bytes of [`content`], with Content-Length
    /// - `/slow/{size}`: same, 64 KB chunks paced 20 ms apart
    /// - `/chunked/{size}`: same bytes, no Content-Length
    /// - `/hop/{n}/{size}`: redirect chain of `n` hops ending at `/blob/{size}`
    /// - `/moved`: 301 to `/blob/2048`
    /// - `/missing`: 404
    /// - `/flaky`: first request breaks after 1 KB of 4 KB, later ones succeed
    /// - `/stall`: sends 1 KB of 2 KB, then goes quiet for 5 s
    pub async fn start() -> Self {
        let hits = Hits::default();
        let app = Router::new()
            .route("/blob/{size}", get(blob))
            .route("/slow/{size}", get(slow))
            .route("/chunked/{size}", get(chunked))
            .route("/hop/{n}/{size}", get(hop))
            .route("/moved", get(moved))
            .route("/missing", get(missing))
            .route("/flaky", get(flaky))
            .route("/stall", get(stall))
            .with_state(hits.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        Self { addr, hits }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn hits(&self, path: &str) -> usize {
        self.hits.0.lock().get(path).copied().unwrap_or(0)
    }

    pub fn total_hits(&self) -> usize {
        self.hits.0.lock().values().sum()
    }
}

fn body_of(data: Vec<u8>, delay: Option<Duration>) -> Body {
    let chunks: Vec<Bytes> = data.chunks(STREAM_CHUNK).map(Bytes::copy_from_slice).collect();
    let stream = stream::iter(chunks).then(move |chunk| async move {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok::<_, std::io::Error>(chunk)
    });
    Body::from_stream(stream)
}

fn sized_response(size: usize, delay: Option<Duration>) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, size.to_string()),
        ],
        body_of(content(size), delay),
    )
        .into_response()
}

async fn blob(State(hits): State<Hits>, uri: Uri, Path(size): Path<usize>) -> Response {
    hits.record(&uri);
    sized_response(size, None)
}

async fn slow(State(hits): State<Hits>, uri: Uri, Path(size): Path<usize>) -> Response {
    hits.record(&uri);
    sized_response(size, Some(Duration::from_millis(20)))
}

async fn chunked(State(hits): State<Hits>, uri: Uri, Path(size): Path<usize>) -> Response {
    hits.record(&uri);
    (StatusCode::OK, body_of(content(size), None)).into_response()
}

async fn hop(State(hits): State<Hits>, uri: Uri, Path((n, size)): Path<(usize, usize)>) -> Response {
    hits.record(&uri);
    let location = if n <= 1 {
        format!("/blob/{}", size)
    } else {
        format!("/hop/{}/{}", n - 1, size)
    };
    (StatusCode::FOUND, [(header::LOCATION, location)], "redirecting").into_response()
}

async fn moved(State(hits): State<Hits>, uri: Uri) -> Response {
    hits.record(&uri);
    (
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, "/blob/2048".to_string())],
    )
        .into_response()
}

async fn missing(State(hits): State<Hits>, uri: Uri) -> Response {
    hits.record(&uri);
    (StatusCode::NOT_FOUND, "no such asset").into_response()
}

async fn flaky(State(hits): State<Hits>, uri: Uri) -> Response {
    let first = {
        let mut map = hits.0.lock();
        let count = map.entry(uri.path().to_string()).or_insert(0);
        *count += 1;
        *count == 1
    };
    if !first {
        return sized_response(4096, None);
    }

    let partial = Bytes::from(content(4096)[..1024].to_vec());
    let broken = stream::iter(vec![
        Ok(partial),
        Err(std::io::Error::other("origin went away")),
    ]);
    (
        StatusCode::OK,
        [(header::CONTENT_LENGTH, "4096".to_string())],
        Body::from_stream(broken),
    )
        .into_response()
}

async fn stall(State(hits): State<Hits>, uri: Uri) -> Response {
    hits.record(&uri);
    let data = content(2048);
    let (head, tail) = (Bytes::copy_from_slice(&data[..1024]), Bytes::copy_from_slice(&data[1024..]));
    let stream = stream::iter(vec![(head, Duration::ZERO), (tail, Duration::from_secs(5))]).then(
        |(chunk, delay)| async move {
            tokio::time::sleep(delay).await;
            Ok::<_, std::io::Error>(chunk)
        },
    );
    (
        StatusCode::OK,
        [(header::CONTENT_LENGTH, "2048".to_string())],
        Body::from_stream(stream),
    )
        .into_response()
}

/// Build a store over `cache_dir` for the given `(relative path, origin url)` pairs.
pub fn store_for(cache_dir: &FsPath, entries: &[(&str, String)], ceiling: Duration) -> Arc<AssetStore> {
    let manifest =
        AssetManifest::from_entries(entries.iter().map(|(p, u)| (*p, u.clone()))).unwrap();
    let origin = Arc::new(HttpOrigin::new(Duration::from_secs(30)).unwrap());
    Arc::new(AssetStore::new(
        manifest,
        DiskCache::new(cache_dir),
        origin,
        ceiling,
    ))
}

/// Poll until `path` exists or `timeout` elapses.
pub async fn wait_for_file(path: &FsPath, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    path.exists()
}
