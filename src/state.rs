//! # Application State Management
//!
//! This module manages shared state that needs to be accessed by the HTTP handlers,
//! the event WebSocket actors and the middleware simultaneously.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Allows multiple parts of the program to safely share ownership of data
//! - **Why needed**: Every actix worker thread gets its own clone of `AppState`
//! - **Memory safety**: Automatically cleans up data when the last reference is dropped
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Allows multiple readers OR one writer at a time (but not both)
//! - **Why parking_lot**: Its locks cannot be poisoned, so reading the config
//!   never needs an `.unwrap()`
//!
//! ### The voice session
//! [`VoiceSession`] is already a cheap, cloneable handle with its own internal
//! locking, so it is stored directly rather than behind another lock.

use crate::audio::session::{SessionSettings, VoiceSession};
use crate::config::AppConfig;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// The main application state that's shared across all request handlers.
///
/// ## Rust Concepts:
/// - **#[derive(Clone)]**: Cloning copies the `Arc`s, not the data behind them
/// - **Arc<RwLock<T>>**: Thread-safe shared mutable data
/// - **Instant**: A point in time (for measuring uptime)
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request and session counters, updated by middleware and handlers
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// The one voice session this client drives
    pub session: VoiceSession,

    /// When the server started (never changes, so no lock needed)
    pub start_time: Instant,
}

/// Counters collected since server start.
///
/// ## Why these metrics matter:
/// - **request_count** / **error_count**: Control API load and reliability
/// - **session_connects** / **session_failures**: How often `connect()` succeeded or failed
/// - **event_subscribers**: Currently open `/ws/events` observers
/// - **endpoint_metrics**: Per-endpoint statistics
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of errors encountered since server start
    pub error_count: u64,

    /// Successful session starts
    pub session_connects: u64,

    /// Session starts that ended in an error
    pub session_failures: u64,

    /// Currently connected event WebSocket clients
    pub event_subscribers: u32,

    /// Key: endpoint name (e.g., "POST /api/v1/session/connect")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
///
/// ## Performance calculations:
/// - **Average response time**: total_duration_ms / request_count
/// - **Error rate**: error_count / request_count
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    /// Number of requests to this specific endpoint
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    /// Number of errors that occurred for this endpoint
    pub error_count: u64,
}

impl AppState {
    /// Create a new AppState around an already-built session.
    ///
    /// ## What this does:
    /// 1. Wraps the config in Arc<RwLock<>> for thread-safe sharing
    /// 2. Creates empty metrics
    /// 3. Records the current time as the server start time
    pub fn new(config: AppConfig, session: VoiceSession) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            session,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// ## Why clone:
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Validate and install a new configuration.
    ///
    /// The session settings are refreshed at the same time, so the next
    /// `connect()` uses the new model, voice and queue sizes. A session that is
    /// already streaming keeps the settings it was started with.
    ///
    /// The audio backend is chosen once at startup, so a config that names a
    /// different one is rejected rather than silently ignored.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;

        let settings = SessionSettings::from_config(&new_config);
        let mut config = self.config.write();
        if config.audio.backend != new_config.audio.backend {
            return Err(format!(
                "audio backend is {:?} and cannot be changed to {:?} without a restart",
                config.audio.backend, new_config.audio.backend
            ));
        }
        *config = new_config;
        drop(config);

        self.session.update_settings(settings);
        Ok(())
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        self.metrics.write().request_count += 1;
    }

    /// Increment the total error counter (called when any request fails).
    pub fn increment_error_count(&self) {
        self.metrics.write().error_count += 1;
    }

    /// Record the outcome of a `connect()` call.
    pub fn record_session_start(&self, succeeded: bool) {
        let mut metrics = self.metrics.write();
        if succeeded {
            metrics.session_connects += 1;
        } else {
            metrics.session_failures += 1;
        }
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// ## Rust Concepts:
    /// - **.entry()**: Gets or creates a HashMap entry
    /// - **.or_default()**: Creates default value if the key doesn't exist
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// An event WebSocket client connected.
    pub fn increment_event_subscribers(&self) {
        self.metrics.write().event_subscribers += 1;
    }

    /// An event WebSocket client went away.
    ///
    /// ## Safety check:
    /// `saturating_sub` keeps an unbalanced call from underflowing.
    pub fn decrement_event_subscribers(&self) {
        let mut metrics = self.metrics.write();
        metrics.event_subscribers = metrics.event_subscribers.saturating_sub(1);
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    ///
    /// ## Why a snapshot:
    /// Clones the data so we don't hold the lock while serializing the response.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().clone()
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time for this endpoint. Zero before the first request.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
