//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - Many workers and actors hold the same state; `Arc` frees it when the last one is gone
//! - `AppState` is cloned into every actix worker, and each clone is just a few pointer copies
//!
//! ### RwLock (Reader-Writer Lock)
//! - HTTP metrics are written on every request and read by `/api/v1/metrics`
//! - Locks are held only long enough to bump a counter or copy a snapshot
//!
//! ## What is NOT here:
//! The configuration is immutable after startup, so it sits behind a plain `Arc`.
//! Relay sessions keep their own counters (see `relay::session`); the per-session
//! data path never takes a lock in this module.

use crate::config::AppConfig;
use crate::relay::session::SessionRegistry;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// State shared across all handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Validated configuration, fixed for the lifetime of the process
    pub config: Arc<AppConfig>,

    /// Live relay sessions
    pub sessions: SessionRegistry,

    /// Request counters for the plain HTTP routes
    http_metrics: Arc<RwLock<HttpMetrics>>,

    /// When the server started
    start_time: Instant,
}

/// Request metrics collected by the metrics middleware.
#[derive(Debug, Default, Clone)]
pub struct HttpMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Key: "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Metrics for one endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let sessions = SessionRegistry::new(config.relay.max_concurrent_sessions);
        Self {
            config: Arc::new(config),
            sessions,
            http_metrics: Arc::new(RwLock::new(HttpMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Record one finished HTTP request.
    pub fn record_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.http_metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.request_count += 1;
        if is_error {
            metrics.error_count += 1;
        }

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Copy of the current HTTP metrics, so no lock is held while serializing.
    pub fn http_snapshot(&self) -> HttpMetrics {
        self.http_metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl HttpMetrics {
    pub fn error_rate(&self) -> f64 {
        ratio(self.error_count, self.request_count)
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        ratio(self.total_duration_ms, self.request_count)
    }

    pub fn error_rate(&self) -> f64 {
        ratio(self.error_count, self.request_count)
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole > 0 {
        part as f64 / whole as f64
    } else {
        0.0
    }
}
