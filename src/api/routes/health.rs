//! Health endpoint for the relay.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::api::server::AppState;
use crate::engine::clock;
use crate::gate::GateDecision;

/// GET /health: liveness plus cache, cooldown and usage counters.
///
/// Never cached and never gated.
pub async fn get_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let (rate_limited, retry_after_secs) = match state.gate.check(clock()) {
        GateDecision::Allowed => (false, 0),
        GateDecision::Blocked { retry_after_secs } => (true, retry_after_secs),
    };

    let resources: Vec<Value> = state
        .engines
        .iter()
        .map(|engine| {
            let stats = engine.cache_stats();
            json!({
                "name": engine.name(),
                "route": engine.route(),
                "ttl_secs": engine.policy().ttl.as_secs(),
                "cache_entries": stats.total_entries,
                "cache_bytes": stats.total_bytes,
                "inflight": engine.inflight(),
            })
        })
        .collect();
    let cache_entries: usize = state
        .engines
        .iter()
        .map(|e| e.cache_stats().total_entries)
        .sum();
    let inflight: usize = state.engines.iter().map(|e| e.inflight()).sum();

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "rate_limited": rate_limited,
        "retry_after_secs": retry_after_secs,
        "cache_entries": cache_entries,
        "inflight": inflight,
        "resources": resources,
        "metrics": state.metrics.snapshot(),
    }))
}
