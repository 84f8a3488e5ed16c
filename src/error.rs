// Failure taxonomy for a single asset fetch attempt.

use std::time::Duration;

use axum::http::StatusCode;
use thiserror::Error;

/// Why an asset could not be delivered from the origin or the cache.
///
/// All variants are local to one asset path: they are reported to the
/// requester and never affect other paths.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// The origin could not be reached or the body stream broke.
    #[error("transport error: {0}")]
    Transport(String),

    /// The origin stopped answering within the connect or read timeout.
    #[error("origin timed out: {0}")]
    OriginTimeout(String),

    /// The origin answered with a non-success, non-redirect status.
    #[error("origin responded with HTTP {0}")]
    Upstream(u16),

    #[error("too many redirects (limit {0})")]
    TooManyRedirects(usize),

    /// A follower gave up waiting for another request's download.
    #[error("timed out after {0:?} waiting for download")]
    DownloadTimeout(Duration),

    /// Writing or publishing the cache file failed.
    #[error("cache write failed: {0}")]
    CacheWrite(String),
}

impl FetchError {
    /// HTTP status reported to the requester for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            FetchError::DownloadTimeout(_) | FetchError::OriginTimeout(_) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            FetchError::Transport(_)
            | FetchError::Upstream(_)
            | FetchError::TooManyRedirects(_)
            | FetchError::CacheWrite(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::OriginTimeout(err.to_string())
        } else {
            FetchError::Transport(err.to_string())
        }
    }

    pub(crate) fn cache_io(context: &str, err: std::io::Error) -> Self {
        FetchError::CacheWrite(format!("{}: {}", context, err))
    }
}
