//! # Application State Management
//!
//! State shared by every HTTP handler. Actix clones `AppState` into each
//! worker, so everything mutable sits behind `Arc<RwLock<T>>`.
//!
//! ## What lives here:
//! - **config**: the live configuration, also read by the call controller at call start
//! - **metrics**: per-endpoint request counters written by the metrics middleware
//! - **call**: handle to the call controller thread
//! - **start_time**: for uptime reporting
//!
//! ## Rust Concepts:
//! - **Arc<RwLock<T>>**: many readers or one writer, shared across worker threads
//! - **Poisoned locks**: a panic while holding a lock poisons it; readers here
//!   recover the inner value instead of propagating the panic

use crate::config::AppConfig;
use crate::session::CallHandle;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub call: CallHandle,
    pub start_time: Instant,
}

/// Request metrics collected across all HTTP requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Key: endpoint name (e.g. `"POST /api/v1/call/start"`)
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AppState {
    /// `config` is the same lock the call controller reads from.
    pub fn new(config: Arc<RwLock<AppConfig>>, call: CallHandle) -> Self {
        Self {
            config,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            call,
            start_time: Instant::now(),
        }
    }

    /// A copy of the current configuration; the lock is released immediately.
    pub fn get_config(&self) -> AppConfig {
        read(&self.config).clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *write(&self.config) = new_config;
        Ok(())
    }

    /// Record one finished request (called by the metrics middleware).
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = write(&self.metrics);
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

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        read(&self.metrics).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl AppMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    /// Average = total duration / number of requests.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of failed requests, from 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
