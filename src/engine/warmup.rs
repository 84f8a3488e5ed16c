use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::store::{AssetStore, WarmOutcome};
use crate::source::traits::OriginSource;

/// Tally of one warm-up pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WarmupReport {
    pub downloaded: usize,
    pub already_cached: usize,
    pub in_flight: usize,
    pub failed: usize,
    pub bytes: u64,
}

/// Download every manifest asset that is not cached yet.
///
/// Runs at most `concurrency` downloads at once. Failures are logged and
/// counted; a later request for the same asset retries it.
pub async fn warm_cache(
    store: Arc<AssetStore>,
    origin: Arc<dyn OriginSource>,
    concurrency: usize,
) -> WarmupReport {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for asset in store.manifest().iter() {
        if store.cache().contains(&asset.relative_path).await {
            debug!("warmup skip {}: already cached", asset.relative_path);
            continue;
        }

        let store = Arc::clone(&store);
        let origin = Arc::clone(&origin);
        let semaphore = Arc::clone(&semaphore);
        let asset = asset.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let outcome = store.warm(&asset, origin).await;
            (asset, outcome)
        });
    }

    let mut report = WarmupReport {
        already_cached: store.manifest().len() - tasks.len(),
        ..WarmupReport::default()
    };

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(WarmOutcome::Downloaded(bytes)))) => {
                report.downloaded += 1;
                report.bytes += bytes;
            }
            Ok((_, Ok(WarmOutcome::AlreadyCached))) => report.already_cached += 1,
            Ok((asset, Ok(WarmOutcome::InFlight))) => {
                debug!("warmup skip {}: request already downloading", asset.relative_path);
                report.in_flight += 1;
            }
            Ok((asset, Err(e))) => {
                warn!("warmup failed for {}: {}", asset.relative_path, e);
                report.failed += 1;
            }
            Err(e) => {
                warn!("warmup task panicked: {}", e);
                report.failed += 1;
            }
        }
    }

    info!(
        "warmup finished: downloaded={} cached={} in_flight={} failed={} bytes={}",
        report.downloaded, report.already_cached, report.in_flight, report.failed, report.bytes
    );
    report
}
