//! Cached resource routes.

use std::sync::Arc;

use axum::extract::{RawQuery, State};

use crate::engine::{relay, Relay, ResourceEngine};

/// GET <route>: serve from cache, an in-flight fetch, or upstream.
///
/// The raw query string is forwarded untouched and is part of the cache key.
pub async fn serve_resource(
    State(engine): State<Arc<ResourceEngine>>,
    RawQuery(query): RawQuery,
) -> Relay {
    engine.handle(query.as_deref()).await
}

/// OPTIONS <route>: CORS preflight.
pub async fn preflight() -> Relay {
    relay::preflight()
}
