//! Upstream transit API access.
//!
//! [`Upstream`] abstracts the network call for testability.
//! [`HttpUpstream`] makes the real authenticated request.

pub mod http;

use async_trait::async_trait;
use axum::body::Bytes;
use tokio::task::JoinError;

pub use http::HttpUpstream;

/// Classified result of one upstream call.
///
/// This is the value every coalesced waiter receives, so it is cheap to clone.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// 2xx with the body passed through verbatim.
    Success(Bytes),
    /// 429, with the raw `Retry-After` header value if upstream sent one.
    RateLimited { retry_after: Option<String> },
    /// Any other non-2xx status with a truncated copy of the body.
    UpstreamError { status: u16, body: String },
    /// Connect/TLS/timeout/body-read failure, or the fetch task died.
    TransportFailure(String),
}

impl FetchOutcome {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::RateLimited { .. } => "rate_limited",
            Self::UpstreamError { .. } => "upstream_error",
            Self::TransportFailure(_) => "transport_failure",
        }
    }
}

impl From<JoinError> for FetchOutcome {
    fn from(err: JoinError) -> Self {
        if err.is_panic() {
            Self::TransportFailure("upstream fetch panicked".into())
        } else {
            Self::TransportFailure(format!("upstream fetch aborted: {err}"))
        }
    }
}

/// Performs a GET against the upstream API.
///
/// `target` is the upstream path plus query string, e.g. `/vehicles?line=4`.
/// Implementations never fail: every result is classified into a [`FetchOutcome`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn fetch(&self, target: &str) -> FetchOutcome;
}
