//! HTTP seam used by the downloader.
//!
//! The engine needs little from the network: a range-support probe, a ranged
//! GET streamed as bytes, a small text GET for the version manifest and a
//! HEAD for files whose size is not known up front. [`ReqwestTransport`] is
//! the production implementation; tests plug in in-memory doubles.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};

use crate::config::DownloadConfig;
use crate::error::TransportError;

pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Response body of a ranged request.
pub struct RangeBody {
    /// File offset of the first byte in `stream`. Equals the requested start
    /// for a 206 answer and 0 when the server ignored the range.
    pub offset: u64,
    pub stream: ByteStream,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether `url` answers ranged requests.
    async fn probe_ranges(&self, url: &str) -> Result<bool, TransportError>;

    /// GET `url` with `Range: bytes=<start>-<end>`.
    async fn get_range(&self, url: &str, start: u64, end: u64) -> Result<RangeBody, TransportError>;

    async fn get_text(&self, url: &str) -> Result<String, TransportError>;

    /// Content-Length reported by a HEAD request, if any.
    async fn content_length(&self, url: &str) -> Result<Option<u64>, TransportError>;
}

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(config: &DownloadConfig) -> Self {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn check_status(url: &str, status: StatusCode) -> Result<(), TransportError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(TransportError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn probe_ranges(&self, url: &str) -> Result<bool, TransportError> {
        let response = self
            .client
            .get(url)
            .header(header::RANGE, "bytes=0-0")
            .send()
            .await?;
        check_status(url, response.status())?;

        let accepts_bytes = response
            .headers()
            .get_all(header::ACCEPT_RANGES)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.split(',').any(|unit| unit.trim().eq_ignore_ascii_case("bytes")));
        Ok(accepts_bytes || response.status() == StatusCode::PARTIAL_CONTENT)
    }

    async fn get_range(&self, url: &str, start: u64, end: u64) -> Result<RangeBody, TransportError> {
        let range_header = format!("bytes={}-{}", start, end);
        let response = self
            .client
            .get(url)
            .header(header::RANGE, range_header)
            .send()
            .await?;
        check_status(url, response.status())?;

        let offset = if response.status() == StatusCode::PARTIAL_CONTENT {
            start
        } else {
            0
        };
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::from))
            .boxed();
        Ok(RangeBody { offset, stream })
    }

    async fn get_text(&self, url: &str) -> Result<String, TransportError> {
        let response = self.client.get(url).send().await?;
        check_status(url, response.status())?;
        Ok(response.text().await?)
    }

    async fn content_length(&self, url: &str) -> Result<Option<u64>, TransportError> {
        let response = self.client.head(url).send().await?;
        check_status(url, response.status())?;
        Ok(response.content_length().filter(|len| *len > 0))
    }
}
