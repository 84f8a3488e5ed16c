use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use crate::error::FetchError;

/// Body of an origin response, yielded chunk by chunk as it arrives.
pub type ByteStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// A successful (2xx) origin response after any redirects were followed.
pub struct OriginResponse {
    /// URL that finally produced the body.
    pub final_url: String,
    pub redirects: usize,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub body: ByteStream,
}

#[async_trait]
pub trait OriginSource: Send + Sync {
    /// Issue a GET for `url` and return the live body stream.
    async fn open(&self, url: &str) -> Result<OriginResponse, FetchError>;
}
