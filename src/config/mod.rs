//! Relay configuration.
//!
//! Resolution order: built-in defaults, then an optional JSON file, then
//! `TRANSIT_RELAY_*` environment variables, then CLI flags (applied by the
//! binary). The result is validated once at startup and never mutated.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{RelayError, Result};

/// Env var overriding `upstream.base_url`.
pub const ENV_UPSTREAM_URL: &str = "TRANSIT_RELAY_UPSTREAM_URL";
/// Env var overriding `upstream.api_key`.
pub const ENV_API_KEY: &str = "TRANSIT_RELAY_API_KEY";
/// Env var overriding `upstream.auth_header`.
pub const ENV_AUTH_HEADER: &str = "TRANSIT_RELAY_AUTH_HEADER";
/// Env var overriding `bind`.
pub const ENV_BIND: &str = "TRANSIT_RELAY_BIND";
/// Env var overriding `port`.
pub const ENV_PORT: &str = "TRANSIT_RELAY_PORT";
/// Env var overriding `default_retry_after_secs`.
pub const ENV_DEFAULT_RETRY_AFTER: &str = "TRANSIT_RELAY_DEFAULT_RETRY_AFTER";
/// Env var overriding `log.format`.
pub const ENV_LOG_FORMAT: &str = "TRANSIT_RELAY_LOG_FORMAT";

const REDACTED: &str = "[REDACTED]";

/// Longest accepted resource TTL (one year).
pub const MAX_TTL_SECS: u64 = 365 * 24 * 60 * 60;

/// Top-level relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Bind address (default: 127.0.0.1).
    pub bind: String,
    /// Listen port.
    pub port: u16,
    /// `Retry-After` sent (and cooldown applied) when upstream answers 429
    /// without one.
    pub default_retry_after_secs: u64,
    /// Per-resource cap on distinct cached keys.
    pub max_cache_entries: usize,
    /// Upstream API connection settings.
    pub upstream: UpstreamConfig,
    /// Cached resource classes, one route each.
    pub resources: Vec<ResourceConfig>,
    /// Log output settings.
    pub log: LogConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8787,
            default_retry_after_secs: 60,
            max_cache_entries: 1024,
            upstream: UpstreamConfig::default(),
            resources: ResourceConfig::defaults(),
            log: LogConfig::default(),
        }
    }
}

/// Upstream API connection settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL every resource path is appended to.
    pub base_url: String,
    /// Subscription key sent in `auth_header`.
    pub api_key: Option<String>,
    /// Header carrying the subscription key.
    pub auth_header: String,
    /// Whole-request timeout; a hung upstream resolves to a transport failure.
    pub timeout_secs: u64,
    /// Bytes of an upstream error body kept for logs and the 502 envelope.
    pub error_body_limit: usize,
    /// `User-Agent` sent upstream.
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            auth_header: "Ocp-Apim-Subscription-Key".to_string(),
            timeout_secs: 10,
            error_body_limit: 500,
            user_agent: concat!("transit-relay/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| REDACTED))
            .field("auth_header", &self.auth_header)
            .field("timeout_secs", &self.timeout_secs)
            .field("error_body_limit", &self.error_body_limit)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

/// One cached resource class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Label used in logs and the health report.
    pub name: String,
    /// Path clients call on the relay.
    pub route: String,
    /// Path on the upstream API; the client's query string is appended.
    pub upstream_path: String,
    /// How long a successful body is served from cache.
    pub ttl_secs: u64,
    /// Advertised to downstream HTTP caches only.
    #[serde(default = "default_stale_while_revalidate")]
    pub stale_while_revalidate_secs: u64,
}

fn default_stale_while_revalidate() -> u64 {
    30
}

impl ResourceConfig {
    /// The two resource classes the map front-end uses: the slow-changing
    /// station list and the fast-changing live vehicle positions.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self {
                name: "stations".to_string(),
                route: "/api/stations".to_string(),
                upstream_path: "/stations".to_string(),
                ttl_secs: 600,
                stale_while_revalidate_secs: 300,
            },
            Self {
                name: "vehicles".to_string(),
                route: "/api/vehicles".to_string(),
                upstream_path: "/vehicles".to_string(),
                ttl_secs: 5,
                stale_while_revalidate_secs: 10,
            },
        ]
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn stale_while_revalidate(&self) -> Duration {
        Duration::from_secs(self.stale_while_revalidate_secs)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines (default).
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(RelayError::Config(format!("unknown log format '{other}'"))),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    /// `EnvFilter` directives; `RUST_LOG` takes precedence when set.
    pub filter: Option<String>,
}

impl ProxyConfig {
    /// Defaults, overlaid with `path` when given, then with the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Parse a JSON config file. Missing fields take their defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Overlay `TRANSIT_RELAY_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Overlay values from an arbitrary variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(url) = get(ENV_UPSTREAM_URL) {
            self.upstream.base_url = url;
        }
        if let Some(key) = get(ENV_API_KEY) {
            self.upstream.api_key = Some(key);
        }
        if let Some(header) = get(ENV_AUTH_HEADER) {
            self.upstream.auth_header = header;
        }
        if let Some(bind) = get(ENV_BIND) {
            self.bind = bind;
        }
        if let Some(port) = get(ENV_PORT) {
            self.port = parse_number(ENV_PORT, &port)?;
        }
        if let Some(secs) = get(ENV_DEFAULT_RETRY_AFTER) {
            self.default_retry_after_secs = parse_number(ENV_DEFAULT_RETRY_AFTER, &secs)?;
        }
        if let Some(format) = get(ENV_LOG_FORMAT) {
            self.log.format = format.parse()?;
        }
        Ok(())
    }

    /// Reject configurations the relay cannot serve with.
    pub fn validate(&self) -> Result<()> {
        let base = self.upstream.base_url.trim();
        if base.is_empty() {
            return Err(RelayError::Config(format!(
                "upstream.base_url is required (or set {ENV_UPSTREAM_URL})"
            )));
        }
        let parsed = Url::parse(base).map_err(|e| {
            RelayError::Config(format!("upstream.base_url '{base}' is not a valid URL: {e}"))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RelayError::Config(format!(
                "upstream.base_url must be http or https, got '{}'",
                parsed.scheme()
            )));
        }
        if self.upstream.timeout_secs == 0 {
            return Err(RelayError::Config(
                "upstream.timeout_secs must be greater than 0".into(),
            ));
        }
        if self.upstream.error_body_limit == 0 {
            return Err(RelayError::Config(
                "upstream.error_body_limit must be greater than 0".into(),
            ));
        }
        if self.resources.is_empty() {
            return Err(RelayError::Config(
                "at least one resource must be configured".into(),
            ));
        }

        let mut routes = HashSet::new();
        for resource in &self.resources {
            if resource.name.trim().is_empty() {
                return Err(RelayError::Config("resource name must not be empty".into()));
            }
            if !resource.route.starts_with('/') || resource.route.contains('?') {
                return Err(RelayError::Config(format!(
                    "resource '{}': route '{}' must be an absolute path without a query",
                    resource.name, resource.route
                )));
            }
            if resource.route == "/health" {
                return Err(RelayError::Config(format!(
                    "resource '{}': /health is reserved",
                    resource.name
                )));
            }
            if !routes.insert(resource.route.as_str()) {
                return Err(RelayError::Config(format!(
                    "duplicate route '{}'",
                    resource.route
                )));
            }
            if !resource.upstream_path.starts_with('/') || resource.upstream_path.contains('?') {
                return Err(RelayError::Config(format!(
                    "resource '{}': upstream_path '{}' must be an absolute path without a query",
                    resource.name, resource.upstream_path
                )));
            }
            if resource.ttl_secs == 0 {
                return Err(RelayError::Config(format!(
                    "resource '{}': ttl_secs must be greater than 0",
                    resource.name
                )));
            }
            if resource.ttl_secs > MAX_TTL_SECS {
                return Err(RelayError::Config(format!(
                    "resource '{}': ttl_secs must be at most {MAX_TTL_SECS}",
                    resource.name
                )));
            }
        }
        Ok(())
    }

    /// Copy safe to print: the credential is masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.upstream.api_key.is_some() {
            copy.upstream.api_key = Some(REDACTED.to_string());
        }
        copy
    }

    pub fn default_retry_after(&self) -> Duration {
        Duration::from_secs(self.default_retry_after_secs)
    }

    /// `bind:port` for the listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| RelayError::Config(format!("{name} must be a number, got '{value}'")))
}
