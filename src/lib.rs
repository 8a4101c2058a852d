//! Transit relay: a caching, single-flight, rate-limit-aware proxy in front
//! of a rate-limited transit data API.
//!
//! - [`engine`] runs the per-request state machine for one resource class
//! - [`cache`] holds the TTL store and the keyed single-flight primitive
//! - [`gate`] tracks the process-wide upstream cooldown
//! - [`upstream`] performs and classifies the authenticated upstream call
//! - [`api`] exposes the engines over HTTP

pub mod api;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod health;
pub mod upstream;

pub use config::ProxyConfig;
pub use error::{RelayError, Result};
