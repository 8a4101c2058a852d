//! Maps fetch outcomes onto outward HTTP responses.

use std::time::Duration;

use axum::body::Bytes;
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    CACHE_CONTROL, CONTENT_TYPE, RETRY_AFTER,
};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde_json::json;

use crate::gate::parse_retry_after;
use crate::upstream::FetchOutcome;

/// A fully-formed response, independent of the HTTP framework until the end.
#[derive(Debug, Clone)]
pub struct Relay {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Relay {
    /// Header value as a string, for tests and logs.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Body parsed as JSON, `Null` if it is not JSON.
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

impl IntoResponse for Relay {
    fn into_response(self) -> Response {
        (self.status, self.headers, self.body).into_response()
    }
}

/// Downstream caching advice for one resource class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub ttl: Duration,
    pub stale_while_revalidate: Duration,
}

impl CachePolicy {
    pub fn cache_control(&self) -> String {
        let ttl = self.ttl.as_secs();
        format!(
            "public, max-age={ttl}, s-maxage={ttl}, stale-while-revalidate={}",
            self.stale_while_revalidate.as_secs()
        )
    }
}

/// Turn a fetch outcome into the response sent to the client.
///
/// A 429 relays upstream's `Retry-After` when it parses, otherwise
/// `default_retry_after` in seconds.
pub fn emit(outcome: &FetchOutcome, policy: &CachePolicy, default_retry_after: Duration) -> Relay {
    match outcome {
        FetchOutcome::Success(body) => success(body.clone(), policy),
        FetchOutcome::RateLimited { retry_after } => {
            let value = retry_after
                .as_deref()
                .filter(|v| parse_retry_after(v, Utc::now()).is_some())
                .and_then(|v| HeaderValue::from_str(v).ok())
                .unwrap_or_else(|| HeaderValue::from(default_retry_after.as_secs()));
            rate_limited(value, "Upstream rate limit exceeded; retry later")
        }
        FetchOutcome::UpstreamError { status, body } => json_response(
            StatusCode::BAD_GATEWAY,
            json!({
                "error": format!("Upstream returned HTTP {status}"),
                "body": body,
            }),
        ),
        FetchOutcome::TransportFailure(_) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": "Failed to fetch data from upstream" }),
        ),
    }
}

/// 200 with the upstream body passed through verbatim.
pub fn success(body: Bytes, policy: &CachePolicy) -> Relay {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(value) = HeaderValue::from_str(&policy.cache_control()) {
        headers.insert(CACHE_CONTROL, value);
    }
    Relay {
        status: StatusCode::OK,
        headers,
        body,
    }
}

/// Local 429 while the gate is closed; upstream is not contacted.
pub fn blocked(retry_after_secs: u64) -> Relay {
    rate_limited(
        HeaderValue::from(retry_after_secs),
        "Upstream rate limit in effect; retry later",
    )
}

/// 204 answer to a CORS preflight.
pub fn preflight() -> Relay {
    let mut headers = HeaderMap::new();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
    Relay {
        status: StatusCode::NO_CONTENT,
        headers,
        body: Bytes::new(),
    }
}

fn rate_limited(retry_after: HeaderValue, message: &str) -> Relay {
    let mut relay = json_response(StatusCode::TOO_MANY_REQUESTS, json!({ "error": message }));
    relay.headers.insert(RETRY_AFTER, retry_after);
    relay
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Relay {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    Relay {
        status,
        headers,
        body: Bytes::from(body.to_string()),
    }
}
