mod common;

use std::sync::Arc;
use std::time::Duration;

use pippin_asset_proxy::engine::store::{AssetBody, WarmOutcome};
use pippin_asset_proxy::engine::warmup::warm_cache;
use pippin_asset_proxy::error::FetchError;
use pippin_asset_proxy::source::http_source::HttpOrigin;

use common::{content, store_for, wait_for_file, Upstream};

const CEILING: Duration = Duration::from_secs(30);

async fn drain(body: AssetBody) -> Vec<u8> {
    match body {
        AssetBody::Cached { path, .. } => tokio::fs::read(path).await.unwrap(),
        AssetBody::Streaming { mut body, .. } => {
            let mut data = Vec::new();
            while let Some(chunk) = body.recv().await {
                data.extend_from_slice(&chunk.unwrap());
            }
            data
        }
    }
}

#[tokio::test]
async fn test_cached_asset_never_touches_network() {
    let upstream = Upstream::start().await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("models")).unwrap();
    std::fs::write(dir.path().join("models/demo.glb"), b"already here").unwrap();

    let store = store_for(
        dir.path(),
        &[("models/demo.glb", upstream.url("/blob/1024"))],
        CEILING,
    );
    let asset = store.manifest().get("models/demo.glb").unwrap().clone();

    match store.open(&asset).await.unwrap() {
        AssetBody::Cached { len, .. } => assert_eq!(len, 12),
        AssetBody::Streaming { .. } => panic!("expected cache hit"),
    }
    assert_eq!(upstream.total_hits(), 0);
    assert_eq!(store.snapshot().upstream_requests, 0);
    assert_eq!(store.snapshot().cache_hits, 1);
}

#[tokio::test]
async fn test_miss_streams_and_publishes_exact_bytes() {
    let upstream = Upstream::start().await;
    let dir = tempfile::tempdir().unwrap();
    let store = store_for(
        dir.path(),
        &[("models/demo.glb", upstream.url("/blob/1000000"))],
        CEILING,
    );
    let asset = store.manifest().get("models/demo.glb").unwrap().clone();

    let body = store.open(&asset).await.unwrap();
    assert!(matches!(
        body,
        AssetBody::Streaming {
            content_length: Some(1_000_000),
            ..
        }
    ));
    assert_eq!(drain(body).await, content(1_000_000));

    let cached = dir.path().join("models/demo.glb");
    assert!(wait_for_file(&cached, Duration::from_secs(5)).await);
    assert_eq!(std::fs::read(&cached).unwrap(), content(1_000_000));
    assert!(!dir.path().join("models/demo.glb.tmp").exists());

    // Second request is a pure cache hit.
    assert!(matches!(
        store.open(&asset).await.unwrap(),
        AssetBody::Cached { len: 1_000_000, .. }
    ));
    assert_eq!(upstream.hits("/blob/1000000"), 1);
}

#[tokio::test]
async fn test_redirected_asset_cached_under_requested_path() {
    let upstream = Upstream::start().await;
    let dir = tempfile::tempdir().unwrap();
    let store = store_for(
        dir.path(),
        &[("music/bgm.mp3", upstream.url("/moved"))],
        CEILING,
    );
    let asset = store.manifest().get("music/bgm.mp3").unwrap().clone();

    let data = drain(store.open(&asset).await.unwrap()).await;
    assert_eq!(data, content(2048));

    let cached = dir.path().join("music/bgm.mp3");
    assert!(wait_for_file(&cached, Duration::from_secs(5)).await);
    assert_eq!(std::fs::read(&cached).unwrap(), content(2048));
    // Nothing named after the intermediate URLs.
    assert!(!dir.path().join("moved").exists());
    assert!(!dir.path().join("blob").exists());
}

#[tokio::test]
async fn test_too_many_redirects_writes_nothing() {
    let upstream = Upstream::start().await;
    let dir = tempfile::tempdir().unwrap();
    let store = store_for(
        dir.path(),
        &[("models/far.glb", upstream.url("/hop/6/4096"))],
        CEILING,
    );
    let asset = store.manifest().get("models/far.glb").unwrap().clone();

    let result = store.open(&asset).await;
    assert!(matches!(result, Err(FetchError::TooManyRedirects(5))));
    assert!(!dir.path().join("models/far.glb").exists());
    assert!(!dir.path().join("models/far.glb.tmp").exists());
    assert!(!store.flights().is_in_flight("models/far.glb"));
}

#[tokio::test]
async fn test_failed_download_is_retried_from_scratch() {
    let upstream = Upstream::start().await;
    let dir = tempfile::tempdir().unwrap();
    let store = store_for(dir.path(), &[("sfx/jump.wav", upstream.url("/flaky"))], CEILING);
    let asset = store.manifest().get("sfx/jump.wav").unwrap().clone();
    let cached = dir.path().join("sfx/jump.wav");

    // First attempt: the origin breaks mid-body.
    match store.open(&asset).await.unwrap() {
        AssetBody::Streaming { mut body, .. } => {
            let mut saw_error = false;
            while let Some(chunk) = body.recv().await {
                if chunk.is_err() {
                    saw_error = true;
                }
            }
            assert!(saw_error);
        }
        AssetBody::Cached { .. } => panic!("expected download"),
    }

    // The flight is released once the failure is recorded.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while store.flights().is_in_flight("sfx/jump.wav") && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!cached.exists());
    assert!(!dir.path().join("sfx/jump.wav.tmp").exists());
    assert_eq!(store.snapshot().downloads_failed, 1);

    // Second attempt downloads again and succeeds.
    let data = drain(store.open(&asset).await.unwrap()).await;
    assert_eq!(data, content(4096));
    assert!(wait_for_file(&cached, Duration::from_secs(5)).await);
    assert_eq!(std::fs::read(&cached).unwrap(), content(4096));
    assert_eq!(upstream.hits("/flaky"), 2);
}

#[tokio::test]
async fn test_follower_times_out_while_leader_finishes() {
    let upstream = Upstream::start().await;
    let dir = tempfile::tempdir().unwrap();
    // 32 chunks at 20 ms each: well past the 100 ms follower ceiling.
    let store = store_for(
        dir.path(),
        &[("models/big.glb", upstream.url("/slow/2097152"))],
        Duration::from_millis(100),
    );
    let asset = store.manifest().get("models/big.glb").unwrap().clone();

    let leader = store.open(&asset).await.unwrap();
    let follower = store.open(&asset).await;
    assert!(matches!(follower, Err(FetchError::DownloadTimeout(_))));

    assert_eq!(drain(leader).await, content(2 * 1024 * 1024));
    let cached = dir.path().join("models/big.glb");
    assert!(wait_for_file(&cached, Duration::from_secs(5)).await);
    assert_eq!(upstream.hits("/slow/2097152"), 1);
}

#[tokio::test]
async fn test_warmup_fetches_only_missing_assets() {
    let upstream = Upstream::start().await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("models")).unwrap();
    std::fs::write(dir.path().join("models/cached.glb"), b"glTF").unwrap();

    let store = store_for(
        dir.path(),
        &[
            ("models/cached.glb", upstream.url("/blob/111")),
            ("models/demo.glb", upstream.url("/blob/5000")),
            ("music/bgm.mp3", upstream.url("/blob/7000")),
            ("music/missing.mp3", upstream.url("/missing")),
        ],
        CEILING,
    );
    let origin = Arc::new(HttpOrigin::new(Duration::from_secs(60)).unwrap());

    let report = warm_cache(Arc::clone(&store), origin, 2).await;
    assert_eq!(report.downloaded, 2);
    assert_eq!(report.already_cached, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.bytes, 12_000);

    assert_eq!(std::fs::read(dir.path().join("models/demo.glb")).unwrap(), content(5000));
    assert_eq!(std::fs::read(dir.path().join("music/bgm.mp3")).unwrap(), content(7000));
    assert_eq!(upstream.hits("/blob/111"), 0);

    // A second pass has nothing left to do but retry the failure.
    let origin = Arc::new(HttpOrigin::new(Duration::from_secs(60)).unwrap());
    let report = warm_cache(Arc::clone(&store), origin, 2).await;
    assert_eq!(report.downloaded, 0);
    assert_eq!(report.already_cached, 3);
    assert_eq!(report.failed, 1);
}

#[tokio::test]
async fn test_warmup_defers_to_inflight_request() {
    let upstream = Upstream::start().await;
    let dir = tempfile::tempdir().unwrap();
    let store = store_for(
        dir.path(),
        &[("models/big.glb", upstream.url("/slow/1048576"))],
        CEILING,
    );
    let asset = store.manifest().get("models/big.glb").unwrap().clone();

    let live = store.open(&asset).await.unwrap();
    let origin = Arc::new(HttpOrigin::new(Duration::from_secs(60)).unwrap());
    assert_eq!(
        store.warm(&asset, origin).await.unwrap(),
        WarmOutcome::InFlight
    );

    assert_eq!(drain(live).await, content(1024 * 1024));
    assert_eq!(upstream.hits("/slow/1048576"), 1);
}
