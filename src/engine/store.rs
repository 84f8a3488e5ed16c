// Asset store — cache lookup first, then single-flight download with streaming tee.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::cache::DiskCache;
use super::flight::{Flight, FlightCoordinator, FlightGuard};
use super::stats::{StatsCollector, StatsSnapshot};
use super::tee::{tee_to_cache, Sink};
use crate::config::{AssetDescriptor, AssetManifest, SINK_CHANNEL_CHUNKS, SINK_STALL_TIMEOUT};
use crate::error::FetchError;
use crate::source::traits::OriginSource;

/// How a requested asset will be delivered.
pub enum AssetBody {
    /// Complete file on disk; serve it with ordinary static-file semantics.
    Cached { path: PathBuf, len: u64 },
    /// This request started the download; chunks arrive as the origin sends them.
    Streaming {
        content_length: Option<u64>,
        body: mpsc::Receiver<Result<Bytes, FetchError>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmOutcome {
    AlreadyCached,
    /// Another request was already downloading the asset.
    InFlight,
    Downloaded(u64),
}

type OpenedTx = oneshot::Sender<Result<Option<u64>, FetchError>>;

pub struct AssetStore {
    manifest: AssetManifest,
    cache: DiskCache,
    flights: FlightCoordinator,
    origin: Arc<dyn OriginSource>,
    stats: StatsCollector,
    sink_stall: Duration,
}

impl AssetStore {
    pub fn new(
        manifest: AssetManifest,
        cache: DiskCache,
        origin: Arc<dyn OriginSource>,
        follower_ceiling: Duration,
    ) -> Self {
        Self {
            manifest,
            cache,
            flights: FlightCoordinator::new(follower_ceiling),
            origin,
            stats: StatsCollector::new(),
            sink_stall: SINK_STALL_TIMEOUT,
        }
    }

    /// Override how long a download waits on a requester that stopped reading.
    pub fn with_sink_stall_timeout(mut self, timeout: Duration) -> Self {
        self.sink_stall = timeout;
        self
    }

    pub fn manifest(&self) -> &AssetManifest {
        &self.manifest
    }

    pub fn cache(&self) -> &DiskCache {
        &self.cache
    }

    pub fn flights(&self) -> &FlightCoordinator {
        &self.flights
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Resolve a request for `asset`.
    ///
    /// The on-disk check comes first and never touches the network. On a miss
    /// the first caller becomes the downloader and receives the live stream;
    /// concurrent callers wait for that download and are then served from disk.
    pub async fn open(self: &Arc<Self>, asset: &AssetDescriptor) -> Result<AssetBody, FetchError> {
        let path = &asset.relative_path;
        if let Some(body) = self.cached_body(path).await {
            self.stats.record_cache_hit();
            return Ok(body);
        }

        match self.flights.acquire(path) {
            Flight::Follower(waiter) => {
                self.stats.record_follower();
                debug!("asset {} downloading elsewhere, waiting", path);
                waiter.wait().await?;
                self.cached_body(path).await.ok_or_else(|| {
                    FetchError::CacheWrite(format!("{} missing after download", path))
                })
            }
            Flight::Leader(guard) => {
                // A previous leader may have published between the check and acquire.
                if let Some(body) = self.cached_body(path).await {
                    guard.complete(Ok(()));
                    self.stats.record_cache_hit();
                    return Ok(body);
                }

                let (tx, rx) = mpsc::channel(SINK_CHANNEL_CHUNKS);
                let (opened_tx, opened_rx) = oneshot::channel();
                let store = Arc::clone(self);
                let origin = Arc::clone(&self.origin);
                let asset = asset.clone();
                // Detached so the download outlives a requester that disconnects.
                tokio::spawn(async move {
                    let _ = store
                        .download(&asset, origin, guard, Some(tx), Some(opened_tx))
                        .await;
                });

                let content_length = opened_rx.await.map_err(|_| {
                    FetchError::Transport("download task ended before response".to_string())
                })??;
                Ok(AssetBody::Streaming {
                    content_length,
                    body: rx,
                })
            }
        }
    }

    /// Populate the cache for `asset` without a requester, using `origin`.
    ///
    /// Shares the coordinator with [`AssetStore::open`], so warm-up and live
    /// requests never download the same path twice.
    pub async fn warm(
        &self,
        asset: &AssetDescriptor,
        origin: Arc<dyn OriginSource>,
    ) -> Result<WarmOutcome, FetchError> {
        let path = &asset.relative_path;
        if self.cache.contains(path).await {
            return Ok(WarmOutcome::AlreadyCached);
        }

        match self.flights.acquire(path) {
            Flight::Follower(_) => Ok(WarmOutcome::InFlight),
            Flight::Leader(guard) => {
                if self.cache.contains(path).await {
                    guard.complete(Ok(()));
                    return Ok(WarmOutcome::AlreadyCached);
                }
                let bytes = self.download(asset, origin, guard, None, None).await?;
                Ok(WarmOutcome::Downloaded(bytes))
            }
        }
    }

    async fn cached_body(&self, path: &str) -> Option<AssetBody> {
        let len = self.cache.cached_len(path).await?;
        Some(AssetBody::Cached {
            path: self.cache.final_path(path),
            len,
        })
    }

    /// Fetch `asset` from the origin into the cache and release the flight.
    async fn download(
        &self,
        asset: &AssetDescriptor,
        origin: Arc<dyn OriginSource>,
        guard: FlightGuard,
        sink: Option<Sink>,
        opened: Option<OpenedTx>,
    ) -> Result<u64, FetchError> {
        let started = Instant::now();
        self.stats.record_upstream_request();
        self.stats.increment_downloads();
        debug!(
            "fetching asset {} from {}",
            asset.relative_path, asset.origin_url
        );

        let mut opened = opened;
        let result = match origin.open(&asset.origin_url).await {
            Ok(response) => {
                if let Some(tx) = opened.take() {
                    let _ = tx.send(Ok(response.content_length));
                }
                if response.redirects > 0 {
                    debug!(
                        "asset {} resolved via {} redirects to {}",
                        asset.relative_path, response.redirects, response.final_url
                    );
                }
                let target = self.cache.final_path(&asset.relative_path);
                tee_to_cache(
                    response.body,
                    response.content_length,
                    sink,
                    self.sink_stall,
                    &target,
                )
                .await
            }
            Err(e) => Err(e),
        };

        self.stats.decrement_downloads();
        match &result {
            Ok(bytes) => {
                self.stats.record_completed(*bytes);
                info!(
                    "cached asset {} ({} bytes) in {} ms",
                    asset.relative_path,
                    bytes,
                    started.elapsed().as_millis()
                );
            }
            Err(e) => {
                self.stats.record_failed();
                warn!("asset {} download failed: {}", asset.relative_path, e);
            }
        }

        guard.complete(result.as_ref().map(|_| ()).map_err(|e| e.clone()));
        // The requester only hears about an origin failure once the path is
        // free again, so an immediate retry starts a fresh download.
        if let (Some(tx), Err(e)) = (opened, &result) {
            let _ = tx.send(Err(e.clone()));
        }
        result
    }
}
