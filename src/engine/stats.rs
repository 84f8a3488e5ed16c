// Process-lifetime counters — origin traffic, cache hits, in-flight downloads.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub upstream_requests: u64,
    pub downloads_completed: u64,
    pub downloads_failed: u64,
    pub downloaded_bytes: u64,
    pub cache_hits: u64,
    pub follower_waits: u64,
    pub active_downloads: u32,
}

pub struct StatsCollector {
    upstream_requests: AtomicU64,
    downloads_completed: AtomicU64,
    downloads_failed: AtomicU64,
    downloaded_bytes: AtomicU64,
    cache_hits: AtomicU64,
    follower_waits: AtomicU64,
    active_downloads: AtomicU32,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            upstream_requests: AtomicU64::new(0),
            downloads_completed: AtomicU64::new(0),
            downloads_failed: AtomicU64::new(0),
            downloaded_bytes: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            follower_waits: AtomicU64::new(0),
            active_downloads: AtomicU32::new(0),
        }
    }

    pub fn record_upstream_request(&self) {
        self.upstream_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, bytes: u64) {
        self.downloads_completed.fetch_add(1, Ordering::Relaxed);
        self.downloaded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.downloads_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_follower(&self) {
        self.follower_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_downloads(&self) {
        self.active_downloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_downloads(&self) {
        self.active_downloads.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            upstream_requests: self.upstream_requests.load(Ordering::Relaxed),
            downloads_completed: self.downloads_completed.load(Ordering::Relaxed),
            downloads_failed: self.downloads_failed.load(Ordering::Relaxed),
            downloaded_bytes: self.downloaded_bytes.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            follower_waits: self.follower_waits.load(Ordering::Relaxed),
            active_downloads: self.active_downloads.load(Ordering::Relaxed),
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}
