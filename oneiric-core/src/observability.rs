//! Structured events and a pluggable metrics sink.
//!
//! This crate never installs a `tracing` subscriber itself — embedding
//! applications own that. It only emits structured events through the
//! ambient subscriber, and accepts an optional [`Metrics`] implementation
//! for counters/histograms, leaving the exporter (Prometheus, StatsD, ...)
//! as an external collaborator.

use std::sync::Arc;

/// A metrics sink a host application can implement to forward counters and
/// observations to its own exporter. The default is a no-op.
pub trait Metrics: Send + Sync {
    fn increment(&self, name: &str, labels: &[(&str, &str)]);
    fn observe(&self, name: &str, value: f64, labels: &[(&str, &str)]);
}

/// A [`Metrics`] implementation that discards everything, used when no
/// metrics backend is wired up.
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn increment(&self, _name: &str, _labels: &[(&str, &str)]) {}
    fn observe(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}
}

pub type SharedMetrics = Arc<dyn Metrics>;

pub fn noop_metrics() -> SharedMetrics {
    Arc::new(NoopMetrics)
}

/// Structured event emission grouped by subsystem. Each function logs at the
/// level appropriate to the event and, where a metric is relevant, records
/// it on the supplied sink.
pub mod events {
    use super::SharedMetrics;

    pub fn swap_started(domain: &str, key: &str, provider: &str) {
        tracing::info!(domain, key, provider, "swap started");
    }

    pub fn swap_succeeded(domain: &str, key: &str, provider: &str, duration_ms: u64, metrics: &SharedMetrics) {
        tracing::info!(domain, key, provider, duration_ms, "swap succeeded");
        metrics.increment("oneiric_swaps_total", &[("domain", domain), ("outcome", "success")]);
        metrics.observe("oneiric_swap_duration_ms", duration_ms as f64, &[("domain", domain)]);
    }

    pub fn swap_failed(domain: &str, key: &str, provider: &str, reason: &str, metrics: &SharedMetrics) {
        tracing::warn!(domain, key, provider, reason, "swap failed, rolled back");
        metrics.increment("oneiric_swaps_total", &[("domain", domain), ("outcome", "failure")]);
    }

    pub fn watcher_skipped_paused(domain: &str, key: &str) {
        tracing::info!(domain, key, reason = "paused", "watcher skipped swap");
    }

    pub fn watcher_deferred_draining(domain: &str, key: &str, retry_after_ms: u64) {
        tracing::info!(domain, key, reason = "draining", retry_after_ms, "watcher deferred swap");
    }

    pub fn remote_sync_succeeded(source: &str, registered: u64, duration_ms: u64, metrics: &SharedMetrics) {
        tracing::info!(source, registered, duration_ms, "remote manifest sync succeeded");
        metrics.increment("oneiric_remote_sync_total", &[("source", source), ("outcome", "success")]);
    }

    pub fn remote_sync_failed(source: &str, reason: &str, metrics: &SharedMetrics) {
        tracing::warn!(source, reason, "remote manifest sync failed");
        metrics.increment("oneiric_remote_sync_total", &[("source", source), ("outcome", "failure")]);
    }

    pub fn circuit_breaker_opened(source: &str) {
        tracing::warn!(source, "circuit breaker opened after consecutive failures");
    }

    pub fn lifecycle_status_load_failed(reason: &str) {
        tracing::warn!(reason, "lifecycle status file missing or corrupt, starting from empty state");
    }
}
