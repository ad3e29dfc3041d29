//! # Application State Management
//!
//! Shared state accessed by every HTTP handler and call actor: the runtime
//! configuration, process metrics, and the long-lived service objects.
//!
//! ## Service Injection:
//! The session registry, circuit breaker, telephony client, and fallback
//! controller are constructed exactly once here and handed out through
//! `AppState`: there are no module-level singletons, so tests can build
//! as many independent instances as they need.
//!
//! ## Thread Safety:
//! Configuration and metrics sit behind `Arc<RwLock<...>>`: many readers
//! or one writer. Every call actor and HTTP worker shares the same state
//! through cheap clones of the `Arc` handles.

use crate::call::registry::CallRegistry;
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::error::AppResult;
use crate::resilience::circuit::CircuitBreaker;
use crate::resilience::fallback::FallbackController;
use crate::telephony::client::{TelephonyClient, TelephonyCredentials};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// The shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Process metrics (updated by middleware and call actors)
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,

    /// Owner of all live call sessions
    pub registry: CallRegistry,

    /// Process-wide failure aggregator
    pub breaker: Arc<CircuitBreaker>,

    /// Provider call-control client
    pub telephony: Arc<TelephonyClient>,

    /// Redirects unrecoverable calls to a human conference
    pub fallback: Arc<FallbackController>,

    /// Time source injected into every expiry/backoff decision
    pub clock: Arc<dyn Clock>,
}

/// Process metrics collected across HTTP requests and calls.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of HTTP errors since server start
    pub error_count: u64,

    /// Calls that opened a media stream
    pub calls_started: u64,

    /// Calls that finished without fallback (any outcome)
    pub calls_completed: u64,

    /// Calls handed to the conference fallback
    pub calls_fallen_back: u64,

    /// Agent socket redials scheduled across all calls
    pub reconnect_attempts: u64,

    /// Detailed metrics for each API endpoint
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Build the state and every injected service from the configuration.
    ///
    /// Credential validation happens here, so a misconfigured deployment
    /// fails at startup instead of during the first live call.
    pub fn new(config: AppConfig) -> AppResult<Self> {
        let credentials = TelephonyCredentials::validate(
            &config.telephony.account_id,
            &config.telephony.secret,
        )?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let registry = CallRegistry::new(config.performance.max_concurrent_calls);
        let breaker = Arc::new(CircuitBreaker::new(
            config.bridge.breaker_threshold,
            Duration::from_millis(config.bridge.breaker_cooldown_ms),
            clock.clone(),
        ));
        let telephony = Arc::new(TelephonyClient::new(
            &config.telephony.api_base_url,
            credentials,
        ));
        let fallback = Arc::new(FallbackController::new(
            telephony.clone(),
            registry.clone(),
        ));

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            registry,
            breaker,
            telephony,
            fallback,
            clock,
        })
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately so other workers aren't
    /// blocked while the caller uses the value.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Update the configuration with validation.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    /// Increment the total request counter (called by middleware).
    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    /// Increment the total error counter (called when any request fails).
    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn record_call_started(&self) {
        self.metrics.write().unwrap().calls_started += 1;
    }

    pub fn record_call_completed(&self) {
        self.metrics.write().unwrap().calls_completed += 1;
    }

    pub fn record_call_fallen_back(&self) {
        self.metrics.write().unwrap().calls_fallen_back += 1;
    }

    pub fn record_reconnect_attempt(&self) {
        self.metrics.write().unwrap().reconnect_attempts += 1;
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    ///
    /// Clones under a read lock so serialization never holds the lock.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            calls_started: metrics.calls_started,
            calls_completed: metrics.calls_completed,
            calls_fallen_back: metrics.calls_fallen_back,
            reconnect_attempts: metrics.reconnect_attempts,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time for this endpoint in milliseconds.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate for this endpoint (0.0 to 1.0).
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

    fn state() -> AppState {
        AppState::new(AppConfig::default()).unwrap()
    }

    #[test]
    fn test_state_construction_validates_credentials() {
        let mut config = AppConfig::default();
        config.telephony.account_id = "bogus".to_string();
        assert!(AppState::new(config).is_err());
    }

    #[test]
    fn test_call_counters() {
        let state = state();
        state.record_call_started();
        state.record_call_started();
        state.record_call_completed();
        state.record_call_fallen_back();
        state.record_reconnect_attempt();

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.calls_started, 2);
        assert_eq!(snapshot.calls_completed, 1);
        assert_eq!(snapshot.calls_fallen_back, 1);
        assert_eq!(snapshot.reconnect_attempts, 1);
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = state();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = snapshot.endpoint_metrics.get("GET /health").unwrap();
        assert_eq!(metric.request_count, 2);
        assert!((metric.average_duration_ms() - 20.0).abs() < f64::EPSILON);
        assert!((metric.error_rate() - 0.5).abs() < f64::EPSILON);
    }
}
