//! Per-resource request handling.
//!
//! A [`ResourceEngine`] owns the cache and single-flight registry for one
//! resource class and shares the process-wide [`RateLimitGate`] with every
//! other engine. Each request walks the same states, first match wins:
//!
//! 1. **Blocked**: the gate is closed, answer 429 locally.
//! 2. **CacheHit**: a fresh body is cached, serve it.
//! 3. **Fetch**: lead or join the single upstream call for the key.
//!
//! The fetch leader commits its outcome (cache write or gate trip) before the
//! key leaves the in-flight registry, so a request that just missed the cache
//! either joins the running fetch or sees the committed result.

pub mod relay;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::cache::{CacheStats, CacheStore, Coalescer, FetchRole};
use crate::config::{ProxyConfig, ResourceConfig};
use crate::gate::{GateDecision, RateLimitGate};
use crate::health::RelayMetrics;
use crate::upstream::{FetchOutcome, Upstream};

pub use relay::{CachePolicy, Relay};

/// Pieces shared by every resource engine in one process.
#[derive(Clone)]
pub struct EngineContext {
    pub gate: Arc<RateLimitGate>,
    pub upstream: Arc<dyn Upstream>,
    pub metrics: Arc<RelayMetrics>,
    pub default_retry_after: Duration,
    pub max_cache_entries: usize,
}

impl EngineContext {
    pub fn new(config: &ProxyConfig, upstream: Arc<dyn Upstream>, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            gate: Arc::new(RateLimitGate::new()),
            upstream,
            metrics,
            default_retry_after: config.default_retry_after(),
            max_cache_entries: config.max_cache_entries,
        }
    }
}

/// Cache, coalescing and gating for one resource class.
pub struct ResourceEngine {
    name: String,
    route: String,
    upstream_path: String,
    policy: CachePolicy,
    default_retry_after: Duration,
    cache: Arc<CacheStore>,
    inflight: Coalescer<FetchOutcome>,
    gate: Arc<RateLimitGate>,
    upstream: Arc<dyn Upstream>,
    metrics: Arc<RelayMetrics>,
}

impl ResourceEngine {
    pub fn new(resource: &ResourceConfig, ctx: &EngineContext) -> Self {
        Self {
            name: resource.name.clone(),
            route: resource.route.clone(),
            upstream_path: resource.upstream_path.clone(),
            policy: CachePolicy {
                ttl: resource.ttl(),
                stale_while_revalidate: resource.stale_while_revalidate(),
            },
            default_retry_after: ctx.default_retry_after,
            cache: Arc::new(CacheStore::new(ctx.max_cache_entries)),
            inflight: Coalescer::new(),
            gate: Arc::clone(&ctx.gate),
            upstream: Arc::clone(&ctx.upstream),
            metrics: Arc::clone(&ctx.metrics),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Keys with an upstream fetch currently running.
    pub fn inflight(&self) -> usize {
        self.inflight.inflight()
    }

    /// Upstream path plus the forwarded query; also the cache and
    /// single-flight key.
    pub fn resource_key(&self, query: Option<&str>) -> String {
        match query.filter(|q| !q.is_empty()) {
            Some(query) => format!("{}?{}", self.upstream_path, query),
            None => self.upstream_path.clone(),
        }
    }

    /// Serve one client request.
    pub async fn handle(&self, query: Option<&str>) -> Relay {
        self.metrics.record_request();
        let key = self.resource_key(query);
        let now = clock();

        if let GateDecision::Blocked { retry_after_secs } = self.gate.check(now) {
            self.metrics.record_blocked();
            debug!(resource = %self.name, key = %key, retry_after_secs, "Upstream cooling down; answering locally");
            return relay::blocked(retry_after_secs);
        }

        if let Some(body) = self.cache.get(&key, now) {
            self.metrics.record_cache_hit();
            debug!(resource = %self.name, key = %key, "Cache hit");
            return relay::success(body, &self.policy);
        }
        self.metrics.record_cache_miss();

        let job = FetchJob {
            resource: self.name.clone(),
            key: key.clone(),
            ttl: self.policy.ttl,
            default_retry_after: self.default_retry_after,
            cache: Arc::clone(&self.cache),
            gate: Arc::clone(&self.gate),
            upstream: Arc::clone(&self.upstream),
            metrics: Arc::clone(&self.metrics),
        };
        let (outcome, role) = self.inflight.fetch_or_join(&key, move || job.run()).await;
        if role == FetchRole::Follower {
            self.metrics.record_coalesced();
        }

        relay::emit(&outcome, &self.policy, self.default_retry_after)
    }
}

impl std::fmt::Debug for ResourceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceEngine")
            .field("name", &self.name)
            .field("route", &self.route)
            .field("upstream_path", &self.upstream_path)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Everything the fetch leader needs, owned so it can run on its own task.
struct FetchJob {
    resource: String,
    key: String,
    ttl: Duration,
    default_retry_after: Duration,
    cache: Arc<CacheStore>,
    gate: Arc<RateLimitGate>,
    upstream: Arc<dyn Upstream>,
    metrics: Arc<RelayMetrics>,
}

impl FetchJob {
    async fn run(self) -> FetchOutcome {
        // Another leader may have committed between our miss and our claim.
        let now = clock();
        if let GateDecision::Blocked { retry_after_secs } = self.gate.check(now) {
            self.metrics.record_blocked();
            return FetchOutcome::RateLimited {
                retry_after: Some(retry_after_secs.to_string()),
            };
        }
        if let Some(body) = self.cache.get(&self.key, now) {
            return FetchOutcome::Success(body);
        }

        self.metrics.record_upstream_call();
        let outcome = self.upstream.fetch(&self.key).await;
        debug!(
            resource = %self.resource,
            key = %self.key,
            outcome = outcome.kind(),
            "Upstream fetch complete"
        );
        self.commit(&outcome);
        outcome
    }

    fn commit(&self, outcome: &FetchOutcome) {
        let now = clock();
        match outcome {
            FetchOutcome::Success(body) => {
                self.cache.set(self.key.clone(), body.clone(), self.ttl, now);
                debug!(
                    resource = %self.resource,
                    key = %self.key,
                    bytes = body.len(),
                    ttl_secs = self.ttl.as_secs(),
                    "Cached upstream response"
                );
            }
            FetchOutcome::RateLimited { retry_after } => {
                self.metrics.record_rate_limited();
                match retry_after.as_deref() {
                    Some(value) => {
                        self.gate.trip(value, now);
                    }
                    None => {
                        info!(
                            resource = %self.resource,
                            default_secs = self.default_retry_after.as_secs(),
                            "Upstream 429 without Retry-After; applying default cooldown"
                        );
                        self.gate.extend(self.default_retry_after, now);
                    }
                }
            }
            FetchOutcome::UpstreamError { status, .. } => {
                self.metrics.record_upstream_error();
                warn!(resource = %self.resource, key = %self.key, status, "Relaying upstream error");
            }
            FetchOutcome::TransportFailure(reason) => {
                self.metrics.record_transport_failure();
                warn!(resource = %self.resource, key = %self.key, reason = %reason, "Relaying transport failure");
            }
        }
    }
}

/// Monotonic now, read from tokio's clock so paused-time tests drive it.
pub(crate) fn clock() -> Instant {
    tokio::time::Instant::now().into_std()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::MockUpstream;
    use axum::body::Bytes;
    use axum::http::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Fake upstream that counts calls, records targets and sleeps before answering.
    struct FakeUpstream {
        calls: AtomicUsize,
        targets: Mutex<Vec<String>>,
        latency: Duration,
        outcome: FetchOutcome,
    }

    impl FakeUpstream {
        fn new(outcome: FetchOutcome, latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                targets: Mutex::new(Vec::new()),
                latency,
                outcome,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Upstream for FakeUpstream {
        async fn fetch(&self, target: &str) -> FetchOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.targets.lock().unwrap().push(target.to_string());
            tokio::time::sleep(self.latency).await;
            self.outcome.clone()
        }
    }

    fn context(upstream: Arc<dyn Upstream>) -> EngineContext {
        EngineContext::new(&ProxyConfig::default(), upstream, Arc::new(RelayMetrics::new()))
    }

    fn resource(name: &str, ttl_secs: u64) -> ResourceConfig {
        ResourceConfig {
            name: name.to_string(),
            route: format!("/api/{name}"),
            upstream_path: format!("/{name}"),
            ttl_secs,
            stale_while_revalidate_secs: 10,
        }
    }

    fn success_body(outcome: &FetchOutcome) -> Option<&Bytes> {
        match outcome {
            FetchOutcome::Success(body) => Some(body),
            _ => None,
        }
    }

    fn ok(body: &'static str) -> FetchOutcome {
        FetchOutcome::Success(Bytes::from_static(body.as_bytes()))
    }

    #[test]
    fn test_resource_key_includes_query() {
        let fake = FakeUpstream::new(ok("{}"), Duration::ZERO);
        let engine = ResourceEngine::new(&resource("vehicles", 5), &context(fake));
        assert_eq!(engine.resource_key(None), "/vehicles");
        assert_eq!(engine.resource_key(Some("")), "/vehicles");
        assert_eq!(engine.resource_key(Some("line=4")), "/vehicles?line=4");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_body_served_without_upstream_call() {
        let fake = FakeUpstream::new(ok(r#"{"stations":[1,2]}"#), Duration::ZERO);
        let engine = ResourceEngine::new(&resource("stations", 600), &context(fake.clone()));

        let first = engine.handle(None).await;
        tokio::time::advance(Duration::from_secs(599)).await;
        let second = engine.handle(None).await;

        assert_eq!(first.status, StatusCode::OK);
        assert_eq!(second.status, StatusCode::OK);
        assert_eq!(first.body, second.body);
        assert_eq!(second.body, Bytes::from_static(br#"{"stations":[1,2]}"#));
        assert_eq!(fake.calls(), 1);
        assert_eq!(
            second.header("cache-control"),
            Some("public, max-age=600, s-maxage=600, stale-while-revalidate=10")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_refetches() {
        let fake = FakeUpstream::new(ok("[]"), Duration::ZERO);
        let engine = ResourceEngine::new(&resource("vehicles", 5), &context(fake.clone()));

        engine.handle(None).await;
        tokio::time::advance(Duration::from_millis(4_900)).await;
        engine.handle(None).await;
        assert_eq!(fake.calls(), 1);

        tokio::time::advance(Duration::from_millis(200)).await;
        engine.handle(None).await;
        assert_eq!(fake.calls(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_requests_make_one_upstream_call() {
        let fake = FakeUpstream::new(ok(r#"{"v":1}"#), Duration::from_millis(50));
        let ctx = context(fake.clone());
        let engine = ResourceEngine::new(&resource("vehicles", 5), &ctx);

        let responses =
            futures::future::join_all((0..8).map(|_| engine.handle(Some("line=4")))).await;

        assert_eq!(fake.calls(), 1);
        assert!(responses.iter().all(|r| r.status == StatusCode::OK));
        assert!(responses.iter().all(|r| r.body == responses[0].body));
        assert_eq!(fake.targets.lock().unwrap().as_slice(), ["/vehicles?line=4"]);
        let metrics = ctx.metrics.snapshot();
        assert_eq!(metrics.upstream_calls, 1);
        assert_eq!(metrics.coalesced, 7);
        assert_eq!(engine.inflight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_tasks_make_one_upstream_call() {
        let fake = FakeUpstream::new(ok(r#"{"v":2}"#), Duration::from_millis(100));
        let engine = Arc::new(ResourceEngine::new(&resource("vehicles", 5), &context(fake.clone())));

        let handles: Vec<_> = (0..12)
            .map(|_| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move { engine.handle(Some("line=9")).await })
            })
            .collect();
        for handle in handles {
            let relay = handle.await.unwrap();
            assert_eq!(relay.body, Bytes::from_static(br#"{"v":2}"#));
        }
        assert_eq!(fake.calls(), 1);
    }

    #[tokio::test]
    async fn test_overflowing_ttl_still_relays_success() {
        let fake = FakeUpstream::new(ok("[7]"), Duration::ZERO);
        let ctx = context(fake.clone());
        let engine = ResourceEngine::new(&resource("vehicles", u64::MAX), &ctx);

        for _ in 0..3 {
            let relay = engine.handle(None).await;
            assert_eq!(relay.status, StatusCode::OK);
            assert_eq!(relay.body, Bytes::from_static(b"[7]"));
        }
        assert_eq!(ctx.metrics.snapshot().transport_failures, 0);
        assert_eq!(engine.cache_stats().total_entries, 0);
    }

    #[tokio::test]
    async fn test_distinct_queries_are_distinct_keys() {
        let fake = FakeUpstream::new(ok("[]"), Duration::ZERO);
        let engine = ResourceEngine::new(&resource("vehicles", 5), &context(fake.clone()));

        engine.handle(Some("line=1")).await;
        engine.handle(Some("line=2")).await;
        engine.handle(Some("line=1")).await;

        assert_eq!(fake.calls(), 2);
        assert_eq!(engine.cache_stats().total_entries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_blocks_every_key_with_countdown() {
        let limited = FakeUpstream::new(
            FetchOutcome::RateLimited {
                retry_after: Some("30".into()),
            },
            Duration::ZERO,
        );
        let ctx = context(limited.clone());
        let vehicles = ResourceEngine::new(&resource("vehicles", 5), &ctx);
        let stations = ResourceEngine::new(&resource("stations", 600), &ctx);

        let first = vehicles.handle(None).await;
        assert_eq!(first.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(first.header("retry-after"), Some("30"));
        assert_eq!(limited.calls(), 1);

        let same = vehicles.handle(None).await;
        assert_eq!(same.header("retry-after"), Some("30"));

        tokio::time::advance(Duration::from_secs(10)).await;
        let other_resource = stations.handle(None).await;
        assert_eq!(other_resource.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(other_resource.header("retry-after"), Some("20"));

        tokio::time::advance(Duration::from_millis(19_500)).await;
        let other_key = vehicles.handle(Some("line=7")).await;
        assert_eq!(other_key.header("retry-after"), Some("1"));
        assert_eq!(limited.calls(), 1);

        tokio::time::advance(Duration::from_millis(500)).await;
        vehicles.handle(None).await;
        assert_eq!(limited.calls(), 2);
        assert_eq!(ctx.metrics.snapshot().blocked, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_without_header_uses_default_cooldown() {
        let limited = FakeUpstream::new(FetchOutcome::RateLimited { retry_after: None }, Duration::ZERO);
        let ctx = context(limited.clone());
        let engine = ResourceEngine::new(&resource("vehicles", 5), &ctx);

        let first = engine.handle(None).await;
        assert_eq!(first.header("retry-after"), Some("60"));

        tokio::time::advance(Duration::from_secs(59)).await;
        let blocked = engine.handle(None).await;
        assert_eq!(blocked.header("retry-after"), Some("1"));
        assert_eq!(limited.calls(), 1);
    }

    #[tokio::test]
    async fn test_malformed_retry_after_leaves_gate_open() {
        let limited = FakeUpstream::new(
            FetchOutcome::RateLimited {
                retry_after: Some("not-a-date".into()),
            },
            Duration::ZERO,
        );
        let ctx = context(limited.clone());
        let engine = ResourceEngine::new(&resource("vehicles", 5), &ctx);

        let first = engine.handle(None).await;
        assert_eq!(first.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ctx.gate.blocked_until(), None);

        engine.handle(None).await;
        assert_eq!(limited.calls(), 2);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let mut mock = MockUpstream::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| FetchOutcome::UpstreamError {
                status: 503,
                body: "maintenance".into(),
            });
        mock.expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| FetchOutcome::TransportFailure("connection reset".into()));
        mock.expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| FetchOutcome::Success(Bytes::from_static(b"[\"fresh\"]")));

        let ctx = context(Arc::new(mock));
        let engine = ResourceEngine::new(&resource("stations", 600), &ctx);

        let error = engine.handle(None).await;
        assert_eq!(error.status, StatusCode::BAD_GATEWAY);
        assert_eq!(error.json()["body"], "maintenance");
        assert!(engine.cache_stats().total_entries == 0);

        let failure = engine.handle(None).await;
        assert_eq!(failure.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ctx.gate.blocked_until(), None);

        let fresh = engine.handle(None).await;
        assert_eq!(fresh.status, StatusCode::OK);
        assert_eq!(fresh.body, Bytes::from_static(b"[\"fresh\"]"));

        let cached = engine.handle(None).await;
        assert_eq!(cached.body, fresh.body);

        let metrics = ctx.metrics.snapshot();
        assert_eq!(metrics.upstream_calls, 3);
        assert_eq!(metrics.upstream_errors, 1);
        assert_eq!(metrics.transport_failures, 1);
        assert_eq!(metrics.cache_hits, 1);
    }

    #[tokio::test]
    async fn test_blocked_gate_skips_upstream_and_cache() {
        let mut mock = MockUpstream::new();
        mock.expect_fetch().times(0);
        let ctx = context(Arc::new(mock));
        let engine = ResourceEngine::new(&resource("vehicles", 5), &ctx);

        ctx.gate.extend(Duration::from_secs(45), clock());
        let relay = engine.handle(Some("line=2")).await;
        assert_eq!(relay.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(relay.header("retry-after"), Some("45"));
    }

    #[tokio::test]
    async fn test_leader_rechecks_cache_after_claim() {
        let fake = FakeUpstream::new(ok("[2]"), Duration::ZERO);
        let ctx = context(fake.clone());
        let engine = ResourceEngine::new(&resource("vehicles", 5), &ctx);

        // Simulates a commit landing between a request's miss and its claim.
        let job = FetchJob {
            resource: "vehicles".into(),
            key: "/vehicles".into(),
            ttl: Duration::from_secs(5),
            default_retry_after: Duration::from_secs(60),
            cache: Arc::clone(&engine.cache),
            gate: Arc::clone(&ctx.gate),
            upstream: fake.clone(),
            metrics: Arc::clone(&ctx.metrics),
        };
        engine
            .cache
            .set("/vehicles".into(), Bytes::from_static(b"[1]"), Duration::from_secs(5), clock());

        let outcome = job.run().await;
        assert_eq!(success_body(&outcome), Some(&Bytes::from_static(b"[1]")));
        assert_eq!(fake.calls(), 0);
    }
}
