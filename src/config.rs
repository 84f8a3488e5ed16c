use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use tracing::{info, warn};

/// Maximum number of redirects followed when fetching from the origin.
pub const MAX_REDIRECTS: usize = 5;

/// Connect timeout for origin requests.
pub const ORIGIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Read timeout for on-demand origin fetches (2 minutes).
pub const ORIGIN_READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Read timeout for startup warm-up fetches (10 minutes).
pub const WARMUP_READ_TIMEOUT: Duration = Duration::from_secs(600);

/// How long a follower waits for another request's download (3 minutes).
pub const FOLLOWER_WAIT_CEILING: Duration = Duration::from_secs(180);

/// Number of chunks buffered between the download task and a slow client.
pub const SINK_CHANNEL_CHUNKS: usize = 16;

/// How long a download waits on a requester that stopped reading before
/// detaching it and carrying on with the cache write alone.
pub const SINK_STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffer size for writes to the temporary cache file (256 KB).
pub const CACHE_WRITE_BUFFER_BYTES: usize = 256 * 1024;

/// `Cache-Control` sent with every asset response (one day).
pub const ASSET_CACHE_CONTROL: &str = "public, max-age=86400";

/// Suffix of in-progress cache files.
pub const TEMP_SUFFIX: &str = "tmp";

/// Top-level configuration for the asset server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP server binds to.
    pub bind_addr: String,
    pub port: u16,
    /// Root for plain static files (`/` maps to `index.html` here).
    pub static_dir: PathBuf,
    /// Root of the asset cache; mirrors manifest relative paths.
    pub cache_dir: PathBuf,
    /// JSON file mapping relative asset paths to origin URLs.
    pub manifest_path: PathBuf,
    /// Pre-populate the cache at startup.
    pub warmup: bool,
    /// Maximum concurrent warm-up downloads.
    pub warmup_concurrency: usize,
    /// Orphaned temp files older than this are removed at startup.
    pub stale_temp_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 8080,
            static_dir: PathBuf::from("."),
            cache_dir: PathBuf::from("."),
            manifest_path: PathBuf::from("assets.json"),
            warmup: true,
            warmup_concurrency: 4,
            stale_temp_secs: 600,
        }
    }
}

impl ServerConfig {
    /// Build the configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ServerConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("BIND_ADDR") {
            config.bind_addr = v;
        }
        if let Some(v) = lookup("PORT") {
            config.port = v.parse().with_context(|| format!("invalid PORT `{}`", v))?;
        }
        if let Some(v) = lookup("STATIC_DIR") {
            config.static_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("CACHE_DIR") {
            config.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ASSET_MANIFEST") {
            config.manifest_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("WARMUP") {
            config.warmup = parse_flag(&v).ok_or_else(|| anyhow!("invalid WARMUP `{}`", v))?;
        }
        if let Some(v) = lookup("WARMUP_CONCURRENCY") {
            config.warmup_concurrency = v
                .parse()
                .with_context(|| format!("invalid WARMUP_CONCURRENCY `{}`", v))?;
        }
        if let Some(v) = lookup("STALE_TEMP_SECS") {
            config.stale_temp_secs = v
                .parse()
                .with_context(|| format!("invalid STALE_TEMP_SECS `{}`", v))?;
        }

        if config.warmup_concurrency == 0 {
            config.warmup_concurrency = 1;
        }

        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    pub fn stale_temp_age(&self) -> Duration {
        Duration::from_secs(self.stale_temp_secs)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// A remote asset that is fetched on first request and cached locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetDescriptor {
    /// Normalized relative path, `/`-separated, no leading slash.
    pub relative_path: String,
    pub origin_url: String,
}

/// Static table of remote assets, fixed for the process lifetime.
#[derive(Debug, Clone, Default)]
pub struct AssetManifest {
    assets: BTreeMap<String, AssetDescriptor>,
}

impl AssetManifest {
    /// Load the manifest from a JSON object of `{ "relative/path": "https://origin/url" }`.
    ///
    /// A missing file yields an empty manifest so the server still serves static files.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "asset manifest {} not found, remote assets disabled",
                    path.display()
                );
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read asset manifest {}", path.display()))
            }
        };

        let entries: BTreeMap<String, String> = serde_json::from_str(&raw)
            .with_context(|| format!("invalid asset manifest {}", path.display()))?;
        let manifest = Self::from_entries(entries)?;
        info!(
            "loaded {} remote assets from {}",
            manifest.len(),
            path.display()
        );
        Ok(manifest)
    }

    pub fn from_entries<I, K, V>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut assets = BTreeMap::new();
        for (path, url) in entries {
            let relative_path = normalize_relative_path(path.as_ref())
                .ok_or_else(|| anyhow!("invalid asset path `{}`", path.as_ref()))?;
            let origin_url = url.into();
            if reqwest::Url::parse(&origin_url).is_err() {
                bail!("invalid origin url `{}` for `{}`", origin_url, relative_path);
            }
            assets.insert(
                relative_path.clone(),
                AssetDescriptor {
                    relative_path,
                    origin_url,
                },
            );
        }
        Ok(Self { assets })
    }

    /// Look up a request path (leading `/` allowed).
    pub fn get(&self, request_path: &str) -> Option<&AssetDescriptor> {
        let key = normalize_relative_path(request_path)?;
        self.assets.get(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AssetDescriptor> {
        self.assets.values()
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

/// Percent-decode a request path.
///
/// Returns `None` when the decoded bytes are not valid UTF-8. The result still
/// has to go through [`normalize_relative_path`] before touching the disk.
pub fn decode_request_path(raw: &str) -> Option<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .ok()
        .map(Cow::into_owned)
}

/// Normalize a request or manifest path into a safe relative path.
///
/// Returns `None` for empty paths, `..`, `.` segments or anything that would
/// escape the root directory.
pub fn normalize_relative_path(raw: &str) -> Option<String> {
    let trimmed = raw.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.contains('\\') || trimmed.contains('\0') {
        return None;
    }

    let mut segments = Vec::new();
    for segment in trimmed.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return None;
        }
        segments.push(segment);
    }

    let joined = segments.join("/");
    // Reject anything the platform would still interpret as non-normal (e.g. `C:`).
    let all_normal = Path::new(&joined)
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    all_normal.then_some(joined)
}
