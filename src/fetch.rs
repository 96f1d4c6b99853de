//! Ranged HTTP fetching with retry
//!
//! All network access goes through a [`Transport`], a single-request seam that
//! tests replace with an in-memory implementation. [`RangedFetcher`] layers the
//! retry policy and status classification on top of it.

use std::sync::Arc;

use crate::config::{Config, RetryConfig};
use crate::error::{Error, Result};
use crate::retry::{IsRetryable, fetch_with_retry};

/// Inclusive byte range, sent as `Range: bytes=start-end`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ByteRange {
    /// First byte offset
    pub start: u64,
    /// Last byte offset (inclusive)
    pub end: u64,
}

impl ByteRange {
    /// Range covering `len` bytes starting at `start`
    ///
    /// Returns `None` for an empty range.
    pub fn with_len(start: u64, len: u64) -> Option<Self> {
        if len == 0 {
            return None;
        }
        Some(Self {
            start,
            end: start.checked_add(len - 1)?,
        })
    }

    /// Number of bytes covered
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always false; empty ranges cannot be constructed
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Value for the `Range` request header
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// A single GET request
#[derive(Clone, Debug)]
pub struct Request<'a> {
    /// Absolute URL
    pub url: &'a str,
    /// Optional partial-content range
    pub range: Option<ByteRange>,
    /// Optional referer header
    pub referer: Option<&'a str>,
}

impl<'a> Request<'a> {
    /// Plain GET of a whole resource
    pub fn get(url: &'a str) -> Self {
        Self {
            url,
            range: None,
            referer: None,
        }
    }

    /// GET of a byte range
    pub fn range(url: &'a str, range: ByteRange) -> Self {
        Self {
            url,
            range: Some(range),
            referer: None,
        }
    }

    /// Attach a referer header
    pub fn with_referer(mut self, referer: &'a str) -> Self {
        self.referer = Some(referer);
        self
    }
}

/// Raw response: status code and full body
#[derive(Clone, Debug)]
pub struct Response {
    /// HTTP status code
    pub status: u16,
    /// Response body
    pub body: Vec<u8>,
}

impl Response {
    /// True for 200 OK and 206 Partial Content
    pub fn is_success(&self) -> bool {
        matches!(self.status, 200 | 206)
    }
}

/// Abstraction over a single HTTP GET, enabling testability.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Perform one request without retrying
    async fn get(&self, request: &Request<'_>) -> Result<Response>;
}

/// Production [`Transport`] backed by a shared reqwest client.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a client from the HTTP and timeout settings in `config`
    pub fn new(config: &Config) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.download.request_timeout)
            .redirect(reqwest::redirect::Policy::limited(50));

        if let Some(proxy) = &config.http.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        if let Some(agent) = &config.http.user_agent {
            builder = builder.user_agent(agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    /// Wrap an existing client
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn get(&self, request: &Request<'_>) -> Result<Response> {
        tracing::debug!(url = request.url, range = ?request.range, "GET");

        let mut builder = self.client.get(request.url);
        if let Some(range) = request.range {
            builder = builder.header(reqwest::header::RANGE, range.header_value());
        }
        if let Some(referer) = request.referer {
            builder = builder.header(reqwest::header::REFERER, referer);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        Ok(Response { status, body })
    }
}

/// Retry wrapper around a [`Transport`]
///
/// Transport errors and HTTP 503 are retried per [`RetryConfig`]; when the
/// attempts run out the call fails with [`Error::Exhausted`].
#[derive(Clone)]
pub struct RangedFetcher {
    transport: Arc<dyn Transport>,
    retry: RetryConfig,
}

impl RangedFetcher {
    /// Create a fetcher over `transport`
    pub fn new(transport: Arc<dyn Transport>, retry: RetryConfig) -> Self {
        Self { transport, retry }
    }

    /// Fetch `range` of `url`; any status other than 200/206 is an error
    pub async fn fetch_range(&self, url: &str, range: ByteRange) -> Result<Vec<u8>> {
        self.fetch_bytes(&Request::range(url, range)).await
    }

    /// Fetch the whole of `url`; any status other than 200/206 is an error
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        self.fetch_bytes(&Request::get(url)).await
    }

    /// Fetch and require a success status
    ///
    /// 503 is retried, any other non-success status fails with
    /// [`Error::RequestFailed`] without retrying. A server may ignore `Range`
    /// and answer 200 with the whole resource; the requested range is then cut
    /// out of that body.
    pub async fn fetch_bytes(&self, request: &Request<'_>) -> Result<Vec<u8>> {
        let response = self
            .with_retry(request, |response| {
                if response.is_success() {
                    Ok(())
                } else {
                    Err(Error::RequestFailed {
                        url: request.url.to_string(),
                        status: response.status,
                    })
                }
            })
            .await?;
        match request.range {
            Some(range) if response.status == 200 => Ok(slice_range(response.body, range)),
            _ => Ok(response.body),
        }
    }

    /// Fetch and return the response for any status except 503
    ///
    /// For endpoints where a non-success status carries meaning (404 on an
    /// item record, 403 on a derived resource URL).
    pub async fn fetch_response(&self, request: &Request<'_>) -> Result<Response> {
        self.with_retry(request, |_| Ok(())).await
    }

    async fn with_retry<C>(&self, request: &Request<'_>, check: C) -> Result<Response>
    where
        C: Fn(&Response) -> Result<()>,
    {
        let check = &check;
        let result = fetch_with_retry(&self.retry, || async move {
            let response = self.transport.get(request).await?;
            if response.status == 503 {
                return Err(Error::ServiceUnavailable {
                    url: request.url.to_string(),
                });
            }
            check(&response)?;
            Ok(response)
        })
        .await;

        match result {
            Err(e) if e.is_retryable() => Err(Error::Exhausted {
                url: request.url.to_string(),
                attempts: self.retry.max_attempts.max(1),
                last_status: e.status(),
            }),
            other => other,
        }
    }
}

/// Bytes `range.start..=range.end` of a full body, clamped to its length
fn slice_range(mut body: Vec<u8>, range: ByteRange) -> Vec<u8> {
    let len = body.len() as u64;
    let start = range.start.min(len) as usize;
    let end = range.end.saturating_add(1).min(len) as usize;
    body.truncate(end);
    body.drain(..start);
    body
}
