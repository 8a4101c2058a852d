//! Reqwest-backed upstream client.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CACHE_CONTROL, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::config::UpstreamConfig;
use crate::error::{RelayError, Result};

use super::{FetchOutcome, Upstream};

/// Authenticated client for the upstream transit API.
pub struct HttpUpstream {
    client: Client,
    base_url: String,
    error_body_limit: usize,
    timeout: Duration,
}

impl std::fmt::Debug for HttpUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpUpstream")
            .field("base_url", &self.base_url)
            .field("error_body_limit", &self.error_body_limit)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl HttpUpstream {
    /// Build a client from configuration.
    ///
    /// Every request carries the credential header, `Accept: application/json`
    /// and `Cache-Control: no-store` so no intermediary answers from its own
    /// cache; freshness is decided by the relay's TTL alone.
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));

        match config.api_key.as_deref().filter(|k| !k.is_empty()) {
            Some(key) => {
                let name = HeaderName::from_bytes(config.auth_header.as_bytes()).map_err(|e| {
                    RelayError::Config(format!(
                        "invalid upstream.auth_header '{}': {}",
                        config.auth_header, e
                    ))
                })?;
                let mut value = HeaderValue::from_str(key).map_err(|_| {
                    RelayError::Config("upstream.api_key contains invalid characters".into())
                })?;
                value.set_sensitive(true);
                headers.insert(name, value);
            }
            None => warn!("No upstream API key configured; requests will be sent unauthenticated"),
        }

        let timeout = config.timeout();
        let client = Client::builder()
            .default_headers(headers)
            .user_agent(config.user_agent.clone())
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            error_body_limit: config.error_body_limit,
            timeout,
        })
    }

    /// Absolute URL for an upstream path-and-query.
    pub fn endpoint(&self, target: &str) -> std::result::Result<Url, url::ParseError> {
        if target.starts_with('/') {
            Url::parse(&format!("{}{}", self.base_url, target))
        } else {
            Url::parse(&format!("{}/{}", self.base_url, target))
        }
    }

    fn describe_error(&self, err: &reqwest::Error) -> String {
        if err.is_timeout() {
            format!("upstream timed out after {}s", self.timeout.as_secs())
        } else if err.is_connect() {
            format!("could not connect to upstream: {err}")
        } else {
            format!("upstream request failed: {err}")
        }
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn fetch(&self, target: &str) -> FetchOutcome {
        let url = match self.endpoint(target) {
            Ok(url) => url,
            Err(e) => return FetchOutcome::TransportFailure(format!("invalid upstream URL: {e}")),
        };

        let started = Instant::now();
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                let reason = self.describe_error(&e);
                warn!(path = target, error = %e, "Upstream request failed");
                return FetchOutcome::TransportFailure(reason);
            }
        };

        let status = response.status();
        debug!(
            path = target,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Upstream responded"
        );

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty());
            warn!(
                path = target,
                retry_after = retry_after.as_deref().unwrap_or("<none>"),
                "Upstream rate limit hit"
            );
            return FetchOutcome::RateLimited { retry_after };
        }

        if !status.is_success() {
            let body = read_capped(response, self.error_body_limit).await;
            warn!(
                path = target,
                status = status.as_u16(),
                body = %body,
                "Upstream returned an error status"
            );
            return FetchOutcome::UpstreamError {
                status: status.as_u16(),
                body,
            };
        }

        match response.bytes().await {
            Ok(body) => FetchOutcome::Success(body),
            Err(e) => {
                warn!(path = target, error = %e, "Failed to read upstream body");
                FetchOutcome::TransportFailure(self.describe_error(&e))
            }
        }
    }
}

/// Read at most `limit` bytes of an error body, then stop pulling chunks.
async fn read_capped(mut response: reqwest::Response, limit: usize) -> String {
    let mut buf = Vec::with_capacity(limit.min(8 * 1024));
    while buf.len() < limit {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let take = (limit - buf.len()).min(chunk.len());
                buf.extend_from_slice(&chunk[..take]);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Upstream error body cut short");
                break;
            }
        }
    }
    truncate_body(&buf, limit)
}

/// First `limit` bytes of `body` as text; invalid UTF-8 is replaced.
pub fn truncate_body(body: &[u8], limit: usize) -> String {
    String::from_utf8_lossy(&body[..body.len().min(limit)]).into_owned()
}
