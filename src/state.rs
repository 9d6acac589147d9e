//! # Application State Management
//!
//! Shared state handed to every HTTP handler through `web::Data`.
//!
//! ## Contents:
//! - **config**: effective configuration, read-only after startup
//! - **warmup**: the single warm-up coordinator for this process
//! - **transcriber**: request path on top of the coordinator
//! - **metrics**: request counters updated by the middleware
//!
//! ## Locking:
//! Metrics sit behind a `parking_lot::RwLock`. The warm-up coordinator has its
//! own mutex; handlers never hold a metrics lock while calling into it.

use crate::config::AppConfig;
use crate::transcription::{TranscriptionService, WarmupCoordinator};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,

    /// Owns the recognizer lifecycle. Exactly one per process.
    pub warmup: Arc<WarmupCoordinator>,

    pub transcriber: Arc<TranscriptionService>,

    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected across all HTTP requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of error responses since server start
    pub error_count: u64,

    /// Transcriptions currently running inference
    pub inflight_transcriptions: u32,

    /// Transcriptions that returned text
    pub completed_transcriptions: u64,

    /// Per-endpoint statistics keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Performance metrics for a single endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, transcriber: Arc<TranscriptionService>) -> Self {
        Self {
            config: Arc::new(config),
            warmup: transcriber.warmup().clone(),
            transcriber,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    pub fn get_config(&self) -> &AppConfig {
        &self.config
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().request_count += 1;
    }

    /// Called for every 4xx/5xx response.
    pub fn increment_error_count(&self) {
        self.metrics.write().error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Mark a transcription as running until the guard is dropped.
    pub fn track_transcription(&self) -> InflightGuard {
        self.metrics.write().inflight_transcriptions += 1;
        InflightGuard {
            metrics: self.metrics.clone(),
            completed: false,
        }
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Decrements the in-flight counter on drop, whatever the outcome.
pub struct InflightGuard {
    metrics: Arc<RwLock<AppMetrics>>,
    completed: bool,
}

impl InflightGuard {
    pub fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let mut metrics = self.metrics.write();
        metrics.inflight_transcriptions = metrics.inflight_transcriptions.saturating_sub(1);
        if self.completed {
            metrics.completed_transcriptions += 1;
        }
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of failed requests, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
