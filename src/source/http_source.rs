use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::redirect::Policy;
use reqwest::{Client, StatusCode, Url};
use tracing::{debug, warn};

use super::traits::{OriginResponse, OriginSource};
use crate::config::{MAX_REDIRECTS, ORIGIN_CONNECT_TIMEOUT};
use crate::error::FetchError;

/// Origin fetcher over plain HTTP(S) that follows redirects itself so the
/// redirect budget is enforced and observable.
pub struct HttpOrigin {
    client: Client,
    max_redirects: usize,
}

impl HttpOrigin {
    /// Build an origin client whose body reads time out after `read_timeout`.
    pub fn new(read_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .redirect(Policy::none())
            .connect_timeout(ORIGIN_CONNECT_TIMEOUT)
            .read_timeout(read_timeout)
            .user_agent(concat!("pippin-asset-proxy/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            max_redirects: MAX_REDIRECTS,
        })
    }

    pub fn with_max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }
}

fn is_followable(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

fn header_str(resp: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<&str> {
    resp.headers().get(name).and_then(|v| v.to_str().ok())
}

#[async_trait]
impl OriginSource for HttpOrigin {
    async fn open(&self, url: &str) -> Result<OriginResponse, FetchError> {
        let mut current = Url::parse(url)
            .map_err(|e| FetchError::Transport(format!("invalid origin url {}: {}", url, e)))?;
        let mut redirects = 0usize;

        loop {
            let resp = self
                .client
                .get(current.clone())
                .send()
                .await
                .map_err(FetchError::from_reqwest)?;

            let status = resp.status();
            if is_followable(status) {
                if redirects >= self.max_redirects {
                    warn!(
                        "origin redirect budget exhausted url={} limit={}",
                        url, self.max_redirects
                    );
                    return Err(FetchError::TooManyRedirects(self.max_redirects));
                }

                let next = header_str(&resp, LOCATION).and_then(|loc| current.join(loc).ok());
                let next = match next {
                    Some(next) => next,
                    None => {
                        warn!(
                            "origin redirect without usable location status={} url={}",
                            status.as_u16(),
                            current
                        );
                        return Err(FetchError::Upstream(status.as_u16()));
                    }
                };

                // Discard the redirect body; its content is never used.
                let _ = resp.bytes().await;

                debug!(
                    "origin redirect status={} from={} to={}",
                    status.as_u16(),
                    current,
                    next
                );
                current = next;
                redirects += 1;
                continue;
            }

            if !status.is_success() {
                warn!("origin fetch failed status={} url={}", status.as_u16(), current);
                return Err(FetchError::Upstream(status.as_u16()));
            }

            let content_length = header_str(&resp, CONTENT_LENGTH).and_then(|v| v.parse::<u64>().ok());
            let content_type = header_str(&resp, CONTENT_TYPE).map(str::to_string);

            debug!(
                "origin opened url={} redirects={} content_length={:?}",
                current, redirects, content_length
            );

            let body = resp
                .bytes_stream()
                .map(|chunk| chunk.map_err(FetchError::from_reqwest))
                .boxed();

            return Ok(OriginResponse {
                final_url: current.to_string(),
                redirects,
                content_length,
                content_type,
                body,
            });
        }
    }
}
