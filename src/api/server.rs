//! Axum server for the relay.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::http::header::ACCESS_CONTROL_ALLOW_ORIGIN;
use axum::http::HeaderValue;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ProxyConfig;
use crate::engine::{EngineContext, ResourceEngine};
use crate::error::Result;
use crate::gate::RateLimitGate;
use crate::health::RelayMetrics;
use crate::upstream::Upstream;

use super::routes;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    /// One engine per configured resource class.
    pub engines: Vec<Arc<ResourceEngine>>,
    /// Process-wide upstream cooldown, shared with every engine.
    pub gate: Arc<RateLimitGate>,
    /// Lock-free usage counters.
    pub metrics: Arc<RelayMetrics>,
    /// Process start, for uptime reporting.
    pub started_at: Instant,
}

impl AppState {
    /// Build one engine per resource, all sharing `upstream` and one gate.
    pub fn from_config(
        config: &ProxyConfig,
        upstream: Arc<dyn Upstream>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        let ctx = EngineContext::new(config, upstream, Arc::clone(&metrics));
        let engines = config
            .resources
            .iter()
            .map(|resource| Arc::new(ResourceEngine::new(resource, &ctx)))
            .collect();
        Self {
            engines,
            gate: ctx.gate,
            metrics,
            started_at: Instant::now(),
        }
    }
}

/// Build the axum router with one route per resource plus `/health`.
pub fn build_router(state: AppState) -> Router {
    let engines = state.engines.clone();
    let shared_state = Arc::new(state);

    let mut app = Router::new()
        .route("/health", get(routes::health::get_health))
        .with_state(shared_state);

    for engine in engines {
        let route = engine.route().to_string();
        let resource = Router::new()
            .route(
                &route,
                get(routes::resource::serve_resource).options(routes::resource::preflight),
            )
            .with_state(engine);
        app = app.merge(resource);
    }

    app.fallback(routes::not_found)
        .layer(SetResponseHeaderLayer::overriding(
            ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(TraceLayer::new_for_http())
}

/// Bind the configured address and serve until `shutdown` resolves.
pub async fn start_server<F>(config: &ProxyConfig, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    serve(listener, state, shutdown).await
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let routes: Vec<String> = state
        .engines
        .iter()
        .map(|e| e.route().to_string())
        .collect();
    let app = build_router(state);
    info!(
        addr = %listener.local_addr()?,
        routes = ?routes,
        "Transit relay listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Transit relay stopped");
    Ok(())
}
