use anyhow::Result;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Process-wide metrics, grounded on `integration-gateway/src/metrics.rs`'s
/// `GatewayMetrics` shape (private `Registry`, counter-vec/gauge/histogram
/// fields, a `render()` returning `text/plain`), generalized to the
/// dimensions this gateway needs (requests, quota, rate limiter, breaker,
/// upstream latency, streaming, prompt-leakage detection).
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    requests_total: IntCounterVec,
    quota_decrements: IntCounterVec,
    quota_refunds: IntCounterVec,
    rate_checks: IntCounterVec,
    rate_rejections: IntCounterVec,
    breaker_transitions: IntCounterVec,
    breaker_open_gauge: IntGauge,
    upstream_latency: Histogram,
    stream_chunks_total: IntCounterVec,
    prompt_leakage_hits: IntCounterVec,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("agentlink_requests_total", "Proxied requests by status and error code"),
            &["status", "error_code"],
        )?;
        let quota_decrements = IntCounterVec::new(
            Opts::new("agentlink_quota_decrements_total", "Quota reservations by outcome"),
            &["outcome"],
        )?;
        let quota_refunds = IntCounterVec::new(
            Opts::new("agentlink_quota_refunds_total", "Quota refunds issued"),
            &["reason"],
        )?;
        let rate_checks = IntCounterVec::new(
            Opts::new("agentlink_rate_limit_checks_total", "Rate limit checks by tier"),
            &["tier"],
        )?;
        let rate_rejections = IntCounterVec::new(
            Opts::new("agentlink_rate_limit_rejections_total", "Rate limit rejections by tier"),
            &["tier"],
        )?;
        let breaker_transitions = IntCounterVec::new(
            Opts::new("agentlink_breaker_transitions_total", "Circuit breaker state transitions"),
            &["provider", "to_state"],
        )?;
        let breaker_open_gauge = IntGauge::with_opts(Opts::new(
            "agentlink_breaker_open_providers",
            "Number of providers whose breaker is currently open",
        ))?;
        let upstream_latency = Histogram::with_opts(HistogramOpts::new(
            "agentlink_upstream_call_duration_seconds",
            "Upstream provider call latency in seconds",
        ))?;
        let stream_chunks_total = IntCounterVec::new(
            Opts::new("agentlink_stream_chunks_total", "Streamed response chunks forwarded"),
            &["provider"],
        )?;
        let prompt_leakage_hits = IntCounterVec::new(
            Opts::new("agentlink_prompt_leakage_hits_total", "Leakage-indicator matches detected"),
            &["kind"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(quota_decrements.clone()))?;
        registry.register(Box::new(quota_refunds.clone()))?;
        registry.register(Box::new(rate_checks.clone()))?;
        registry.register(Box::new(rate_rejections.clone()))?;
        registry.register(Box::new(breaker_transitions.clone()))?;
        registry.register(Box::new(breaker_open_gauge.clone()))?;
        registry.register(Box::new(upstream_latency.clone()))?;
        registry.register(Box::new(stream_chunks_total.clone()))?;
        registry.register(Box::new(prompt_leakage_hits.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            quota_decrements,
            quota_refunds,
            rate_checks,
            rate_rejections,
            breaker_transitions,
            breaker_open_gauge,
            upstream_latency,
            stream_chunks_total,
            prompt_leakage_hits,
        })
    }

    pub fn record_request(&self, status: u16, error_code: &str) {
        self.requests_total.with_label_values(&[&status.to_string(), error_code]).inc();
    }

    pub fn record_quota_decrement(&self, outcome: &str) {
        self.quota_decrements.with_label_values(&[outcome]).inc();
    }

    pub fn record_quota_refund(&self, reason: &str) {
        self.quota_refunds.with_label_values(&[reason]).inc();
    }

    pub fn record_rate_check(&self, tier: &str, allowed: bool) {
        self.rate_checks.with_label_values(&[tier]).inc();
        if !allowed {
            self.rate_rejections.with_label_values(&[tier]).inc();
        }
    }

    pub fn record_breaker_transition(&self, provider: &str, to_state: &str) {
        self.breaker_transitions.with_label_values(&[provider, to_state]).inc();
    }

    pub fn set_breaker_open_count(&self, count: i64) {
        self.breaker_open_gauge.set(count);
    }

    pub fn observe_upstream_latency(&self, secs: f64) {
        self.upstream_latency.observe(secs);
    }

    pub fn record_stream_chunk(&self, provider: &str) {
        self.stream_chunks_total.with_label_values(&[provider]).inc();
    }

    pub fn record_prompt_leakage_hit(&self, kind: &str) {
        self.prompt_leakage_hits.with_label_values(&[kind]).inc();
    }

    pub fn render(&self) -> Result<Response> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"))
            .body(Body::from(buffer))?;
        Ok(response)
    }
}
