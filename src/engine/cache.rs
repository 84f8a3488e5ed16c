// On-disk asset cache — final files mirror manifest paths, downloads land in `<file>.tmp` first.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::{AssetManifest, TEMP_SUFFIX};

#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final location of a cached asset. `relative_path` must already be normalized.
    pub fn final_path(&self, relative_path: &str) -> PathBuf {
        self.root.join(relative_path)
    }

    /// Location the asset is streamed into before publication.
    pub fn temp_path(&self, relative_path: &str) -> PathBuf {
        temp_path_for(&self.final_path(relative_path))
    }

    /// Size of the cached file, or `None` if the asset is not cached.
    pub async fn cached_len(&self, relative_path: &str) -> Option<u64> {
        match tokio::fs::metadata(self.final_path(relative_path)).await {
            Ok(meta) if meta.is_file() => Some(meta.len()),
            _ => None,
        }
    }

    pub async fn contains(&self, relative_path: &str) -> bool {
        self.cached_len(relative_path).await.is_some()
    }

    /// Delete temp files of manifest assets older than `max_age`, left behind
    /// by an interrupted process.
    ///
    /// Only `<asset>.tmp` paths of manifest entries are considered; other files
    /// under the cache root are never touched. Returns the number removed.
    pub async fn remove_stale_temp_files(
        &self,
        manifest: &AssetManifest,
        max_age: Duration,
    ) -> Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0usize;

        for asset in manifest.iter() {
            let path = self.temp_path(&asset.relative_path);
            let meta = match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("failed to stat temp file {}", path.display()))
                }
            };

            let age = meta
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < max_age {
                debug!("keeping recent temp file {} age={:?}", path.display(), age);
                continue;
            }

            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    removed += 1;
                    debug!("removed stale temp file {}", path.display());
                }
                Err(e) => warn!("failed to remove stale temp file {}: {}", path.display(), e),
            }
        }

        if removed > 0 {
            info!(
                "removed {} stale temp files under {}",
                removed,
                self.root.display()
            );
        }
        Ok(removed)
    }
}

pub fn temp_path_for(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".");
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

/// Whether `path` names an in-progress download.
pub fn is_temp_path(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(TEMP_SUFFIX)
}
