//! Prometheus metrics served at `/metrics`.
//!
//! Request counters are bumped by the [`track`] middleware. Cache and notification
//! figures are sampled from their owners on every scrape.

use std::fmt;
use std::sync::atomic::AtomicI64;

use axum::extract::{MatchedPath, Request, State};
use axum::middleware::Next;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use services::NotifyStats;
use storage_adapters::CacheStats;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub method: String,
    pub path: String,
    pub status: String,
}

pub struct Metrics {
    registry: Registry,
    requests: Family<RequestLabels, Counter>,
    cache_hits: Gauge<i64, AtomicI64>,
    cache_misses: Gauge<i64, AtomicI64>,
    cache_keys: Gauge<i64, AtomicI64>,
    notify_queued: Gauge<i64, AtomicI64>,
    notify_dropped: Gauge<i64, AtomicI64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("rusty_comments");
        let requests = Family::<RequestLabels, Counter>::default();
        registry.register("http_requests", "Handled HTTP requests", requests.clone());

        let cache_hits = Gauge::default();
        let cache_misses = Gauge::default();
        let cache_keys = Gauge::default();
        registry.register("cache_hits", "Response cache hits since start", cache_hits.clone());
        registry.register("cache_misses", "Response cache misses since start", cache_misses.clone());
        registry.register("cache_keys", "Entries held by the response cache", cache_keys.clone());

        let notify_queued = Gauge::default();
        let notify_dropped = Gauge::default();
        registry.register("notifications_queued", "Notifications accepted by the queue", notify_queued.clone());
        registry.register("notifications_dropped", "Notifications dropped on a full queue", notify_dropped.clone());

        Self { registry, requests, cache_hits, cache_misses, cache_keys, notify_queued, notify_dropped }
    }

    pub fn observe_request(&self, method: &str, path: &str, status: u16) {
        let labels = RequestLabels { method: method.to_string(), path: path.to_string(), status: status.to_string() };
        self.requests.get_or_create(&labels).inc();
    }

    /// Text exposition of everything registered.
    pub fn render(&self, cache: CacheStats, notify: NotifyStats) -> Result<String, fmt::Error> {
        self.cache_hits.set(to_i64(cache.hits));
        self.cache_misses.set(to_i64(cache.misses));
        self.cache_keys.set(to_i64(cache.keys as u64));
        self.notify_queued.set(to_i64(notify.queued));
        self.notify_dropped.set(to_i64(notify.dropped));

        let mut out = String::new();
        encode(&mut out, &self.registry)?;
        Ok(out)
    }
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Counts every routed request by method, route template and status.
pub async fn track(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let method = request.method().as_str().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let resp = next.run(request).await;
    state.metrics.observe_request(&method, &path, resp.status().as_u16());
    resp
}

/// `GET /metrics`
pub async fn serve(State(state): State<AppState>) -> Result<Response, ApiError> {
    let body = state
        .metrics
        .render(state.cache.stats(), state.notify.stats())
        .map_err(|e| anyhow::anyhow!("metrics encoding failed, {e}"))?;
    Ok(([(CONTENT_TYPE, "application/openmetrics-text; version=1.0.0; charset=utf-8")], body).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_counters_and_samples() {
        let m = Metrics::new();
        m.observe_request("GET", "/api/v1/find", 200);
        m.observe_request("GET", "/api/v1/find", 200);
        let out = m
            .render(CacheStats { hits: 3, misses: 1, keys: 1, size: 10 }, NotifyStats { queued: 5, dropped: 2 })
            .unwrap();
        assert!(out.contains(r#"rusty_comments_http_requests_total{method="GET",path="/api/v1/find",status="200"} 2"#));
        assert!(out.contains("rusty_comments_cache_hits 3"));
        assert!(out.contains("rusty_comments_notifications_dropped 2"));
    }
}
