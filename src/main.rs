use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use pippin_asset_proxy::config::{
    AssetManifest, ServerConfig, FOLLOWER_WAIT_CEILING, ORIGIN_READ_TIMEOUT, WARMUP_READ_TIMEOUT,
};
use pippin_asset_proxy::engine::cache::DiskCache;
use pippin_asset_proxy::engine::store::AssetStore;
use pippin_asset_proxy::engine::warmup::warm_cache;
use pippin_asset_proxy::logging::init_tracing;
use pippin_asset_proxy::server::handler::{AppState, AssetServer};
use pippin_asset_proxy::source::http_source::HttpOrigin;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = ServerConfig::from_env().context("invalid configuration")?;
    let manifest = AssetManifest::load(&config.manifest_path)?;

    let cache = DiskCache::new(&config.cache_dir);
    if let Err(e) = cache.remove_stale_temp_files(&manifest, config.stale_temp_age()).await {
        warn!("stale temp cleanup failed: {:#}", e);
    }

    let origin = Arc::new(HttpOrigin::new(ORIGIN_READ_TIMEOUT).context("failed to build origin client")?);
    let store = Arc::new(AssetStore::new(
        manifest,
        cache,
        origin,
        FOLLOWER_WAIT_CEILING,
    ));

    if config.warmup && !store.manifest().is_empty() {
        let warmup_origin =
            Arc::new(HttpOrigin::new(WARMUP_READ_TIMEOUT).context("failed to build warm-up client")?);
        let warmup_store = Arc::clone(&store);
        let concurrency = config.warmup_concurrency;
        tokio::spawn(async move {
            warm_cache(Arc::clone(&warmup_store), warmup_origin, concurrency).await;
            info!("cache stats after warmup: {:?}", warmup_store.snapshot());
        });
    }

    let state = AppState::new(Arc::clone(&store), config.static_dir.clone());
    let server = AssetServer::start(&config.listen_addr(), state).await?;
    info!(
        "serving {} remote assets, static root {}, cache {}",
        store.manifest().len(),
        config.static_dir.display(),
        config.cache_dir.display()
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    server.shutdown().await;
    info!("final cache stats: {:?}", store.snapshot());
    Ok(())
}
