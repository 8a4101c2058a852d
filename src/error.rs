//! Crate-wide error type.
//!
//! Upstream failures are not errors at this level: they are classified into
//! [`FetchOutcome`](crate::upstream::FetchOutcome) values and relayed to the
//! caller. `RelayError` covers the things that stop the process from serving
//! at all (bad configuration, bind failures, client construction).

use thiserror::Error;

/// Errors raised while configuring or starting the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Invalid or missing configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem or socket failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The upstream HTTP client could not be built.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// A config file or payload was not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = RelayError::Config("upstream.base_url is empty".into());
        assert_eq!(
            err.to_string(),
            "Configuration error: upstream.base_url is empty"
        );
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "port taken");
        let err: RelayError = io.into();
        assert!(matches!(err, RelayError::Io(_)));
        assert!(err.to_string().contains("port taken"));
    }

    #[test]
    fn test_json_error_converts() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: RelayError = parse.into();
        assert!(err.to_string().starts_with("JSON error"));
    }
}
