//! # Application State Management
//!
//! Shared state every HTTP handler can reach: the runtime configuration, request
//! metrics and the session manager.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Every actix worker thread holds its own clone of `AppState`
//! - **Shared ownership**: The session manager and the worker directory exist once
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Many readers OR one writer
//! - **Config**: Read on every offer, written only by `PUT /api/v1/config`
//! - **Metrics**: Written by the middleware on every request
//! - **parking_lot**: Locks never poison, so there is nothing to unwrap
//!
//! ### What is NOT in here
//! Per-session state lives inside each session's task group. Handlers only see the
//! manager's handles.

use crate::broker::{BrokerSettings, StaticDirectory, WorkerDirectory};
use crate::config::AppConfig;
use crate::rtc::{SessionContext, SessionManager};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The main application state that's shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (the `webrtc` section can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request and session counters, updated by middleware and handlers
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Every running RTC session
    pub sessions: Arc<SessionManager>,

    /// Where sessions find their workers
    pub directory: Arc<dyn WorkerDirectory>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected across all HTTP requests.
///
/// ## Why these metrics matter:
/// - **request_count / error_count**: load and reliability of the signaling endpoint
/// - **rejected_count**: offers turned away by admission control (HTTP 429)
/// - **sessions_created / sessions_failed**: how often negotiation succeeds
/// - **endpoint_metrics**: per-endpoint timing
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub rejected_count: u64,
    pub sessions_created: u64,
    pub sessions_failed: u64,

    /// Key: "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    pub error_count: u64,
}

impl AppState {
    /// Create the shared state.
    ///
    /// The worker directory is built once from the `workers` section, which is not
    /// runtime-updatable.
    pub fn new(config: AppConfig) -> Self {
        let directory: Arc<dyn WorkerDirectory> = Arc::new(StaticDirectory::new(config.workers.clone()));
        let sessions = Arc::new(SessionManager::new(config.pipeline.join_timeout()));
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            sessions,
            directory,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so offers never wait on each other.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    /// Everything a new session copies out of the current configuration.
    pub fn session_context(&self) -> SessionContext {
        let config = self.config.read();
        SessionContext {
            ice_servers: config.webrtc.ice_servers.clone(),
            directory: self.directory.clone(),
            broker: BrokerSettings::from_config(&config.pipeline, &config.workers),
            finalize_poll: config.pipeline.finalize_poll(),
            answer_timeout: Duration::from_secs(config.pipeline.answer_timeout_secs),
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.config.read().webrtc.max_sessions
    }

    /// Admission control: full once the live session count exceeds the maximum.
    pub fn over_session_limit(&self) -> bool {
        self.sessions.session_count() > self.max_sessions()
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().request_count += 1;
    }

    /// Called for every 4xx/5xx response.
    pub fn increment_error_count(&self) {
        self.metrics.write().error_count += 1;
    }

    /// Called for every 429 response.
    pub fn increment_rejected_count(&self) {
        self.metrics.write().rejected_count += 1;
    }

    pub fn record_session_created(&self) {
        self.metrics.write().sessions_created += 1;
    }

    pub fn record_session_failed(&self) {
        self.metrics.write().sessions_failed += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// The first request to an endpoint creates its entry with zeroed counters.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Consistent copy of the counters, taken under one read lock.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average = Total Duration ÷ Number of Requests
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate between 0.0 and 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_metrics() {
        let state = AppState::new(AppConfig::default());
        state.record_endpoint_request("POST /api/v1/RTCSignalingServer/offer", 40, false);
        state.record_endpoint_request("POST /api/v1/RTCSignalingServer/offer", 20, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["POST /api/v1/RTCSignalingServer/offer"];
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.average_duration_ms(), 30.0);
        assert_eq!(metric.error_rate(), 0.5);
    }

    #[test]
    fn test_session_context_follows_config_updates() {
        let state = AppState::new(AppConfig::default());
        let mut config = state.get_config();
        config.webrtc.ice_servers.clear();
        config.pipeline.answer_timeout_secs = 5;
        state.update_config(config).unwrap();

        let context = state.session_context();
        assert!(context.ice_servers.is_empty());
        assert_eq!(context.answer_timeout, Duration::from_secs(5));
        assert!(!state.over_session_limit());
    }
}
