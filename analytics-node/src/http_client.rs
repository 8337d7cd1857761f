use std::time;

use analytics_core::error::ValidationError;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::TransportError;

pub const USER_AGENT: &str = concat!("analytics-node/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// The parts of a response the delivery queue cares about.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub retry_after: Option<time::Duration>,
}

/// The transport boundary. Implementations must give up promptly, with
/// `TransportError::Cancelled`, once `signal` is cancelled.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn send(
        &self,
        request: HttpRequest,
        signal: CancellationToken,
    ) -> Result<HttpResponse, TransportError>;
}

/// Headers sent with every batch: basic auth with the write key as username, JSON body.
pub fn batch_headers(write_key: &str) -> Result<HeaderMap, ValidationError> {
    let credentials = STANDARD.encode(format!("{}:", write_key));
    let authorization = HeaderValue::from_str(&format!("Basic {}", credentials))
        .map_err(|_| ValidationError::new("writeKey", "writeKey is not a valid header value"))?;

    let mut headers = HeaderMap::new();
    headers.insert(header::AUTHORIZATION, authorization);
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));

    Ok(headers)
}

/// Default transport backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(request_timeout: time::Duration) -> reqwest::Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(
        &self,
        request: HttpRequest,
        signal: CancellationToken,
    ) -> Result<HttpResponse, TransportError> {
        let pending = self
            .client
            .request(request.method, request.url)
            .headers(request.headers)
            .body(request.body)
            .send();

        let response = tokio::select! {
            biased;
            _ = signal.cancelled() => return Err(TransportError::Cancelled),
            response = pending => response.map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Request(e.to_string())
                }
            })?,
        };

        Ok(HttpResponse {
            status: response.status(),
            retry_after: parse_retry_after_header(response.headers()),
        })
    }
}

/// Attempt to parse a `time::Duration` from a Retry-After header, returning None if not possible.
/// Retry-After header can specify a date in RFC2822 or a number of seconds; we try to parse both.
fn parse_retry_after_header(header_map: &HeaderMap) -> Option<time::Duration> {
    let retry_after = header_map.get(header::RETRY_AFTER)?.to_str().ok()?;

    if let Ok(u) = retry_after.parse::<u64>() {
        return Some(time::Duration::from_secs(u));
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let duration =
            chrono::DateTime::<chrono::offset::Utc>::from(dt) - chrono::offset::Utc::now();

        // This can only fail when negative, in which case we return None.
        return duration.to_std().ok();
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_headers_use_the_write_key_as_basic_auth_username() {
        let headers = batch_headers("__TEST__").unwrap();

        assert_eq!(headers[header::AUTHORIZATION], "Basic X19URVNUX186");
        assert_eq!(headers[header::CONTENT_TYPE], "application/json");
        assert!(headers[header::USER_AGENT]
            .to_str()
            .unwrap()
            .starts_with("analytics-node/"));
    }

    #[test]
    fn parse_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(header::RETRY_AFTER, HeaderValue::from_static("120"));

        assert_eq!(
            parse_retry_after_header(&headers),
            Some(time::Duration::from_secs(120))
        );
    }

    #[test]
    fn parse_retry_after_date_in_the_past_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );

        assert_eq!(parse_retry_after_header(&headers), None);
    }

    #[test]
    fn parse_retry_after_garbage_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(header::RETRY_AFTER, HeaderValue::from_static("soon"));

        assert_eq!(parse_retry_after_header(&headers), None);
        assert_eq!(parse_retry_after_header(&HeaderMap::new()), None);
    }
}
