//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor.
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: every worker thread holds a reference to the same data
//! - **RwLock**: many readers or one writer at a time
//!
//! Nothing here is per-connection. Per-connection state lives in the
//! connection's actor (see `websocket.rs`), so connections never contend
//! with each other except on the counters below.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crate::auth::{CognitoCredentialBroker, CredentialBroker, SessionAuthenticator, TokenVerifier};
use crate::chat::TextGenerationClient;
use crate::config::AppConfig;

/// Timeout for calls to the identity provider.
const IDENTITY_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Connect timeout for the text-generation service. Replies stream for as
/// long as the service keeps sending, so there is no overall timeout.
const CHAT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The main application state shared across all handlers and actors.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration, loaded once at startup
    pub config: Arc<RwLock<AppConfig>>,

    /// Counters updated by the metrics middleware and the WebSocket actors
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Verifies bearer tokens at connection time
    pub verifier: Arc<dyn TokenVerifier>,

    /// Exchanges bearer tokens for the voice process's credentials
    pub broker: Arc<dyn CredentialBroker>,

    /// Streams text chat replies
    pub text_generation: Arc<TextGenerationClient>,

    /// When the server started
    pub start_time: Instant,
}

/// Metrics collected across all requests and connections.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of failed HTTP requests since server start
    pub error_count: u64,

    /// WebSocket connections currently open
    pub open_connections: u32,

    /// Voice processes currently running
    pub voice_processes: u32,

    /// WebSocket connections accepted since server start
    pub total_connections: u64,

    /// Voice processes started since server start
    pub total_voice_sessions: u64,

    /// Key: endpoint name (e.g., "GET /health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Performance metrics for a specific HTTP endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Create the state with explicit authentication backends.
    pub fn new(
        config: AppConfig,
        verifier: Arc<dyn TokenVerifier>,
        broker: Arc<dyn CredentialBroker>,
    ) -> Self {
        let text_generation = Arc::new(TextGenerationClient::new(&config.chat, reqwest::Client::new()));
        Self {
            text_generation,
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            verifier,
            broker,
            start_time: Instant::now(),
        }
    }

    /// Create the state with the production identity-provider clients.
    ///
    /// Both identity clients share one HTTP connection pool.
    pub fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(IDENTITY_HTTP_TIMEOUT)
            .build()?;
        let chat_http = reqwest::Client::builder()
            .connect_timeout(CHAT_CONNECT_TIMEOUT)
            .build()?;

        let verifier = Arc::new(SessionAuthenticator::new(&config.auth, http.clone()));
        let broker = Arc::new(CognitoCredentialBroker::new(&config.auth, http));
        let text_generation = Arc::new(TextGenerationClient::new(&config.chat, chat_http));

        let mut state = Self::new(config, verifier, broker);
        state.text_generation = text_generation;
        Ok(state)
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn metrics_read(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics_write(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        self.metrics_write().request_count += 1;
    }

    /// Increment the total error counter (4xx and 5xx responses).
    pub fn increment_error_count(&self) {
        self.metrics_write().error_count += 1;
    }

    /// Record timing and outcome of one request to `endpoint`.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_write();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Admit a new WebSocket connection if the limit allows it.
    ///
    /// The check and the increment happen under one write lock, so concurrent
    /// upgrades cannot overshoot `max_concurrent_sessions`.
    pub fn try_open_connection(&self) -> bool {
        let limit = self.get_config().performance.max_concurrent_sessions;
        let mut metrics = self.metrics_write();
        if metrics.open_connections as usize >= limit {
            return false;
        }
        metrics.open_connections += 1;
        metrics.total_connections += 1;
        true
    }

    /// Release a connection admitted by [`try_open_connection`](Self::try_open_connection).
    pub fn close_connection(&self) {
        let mut metrics = self.metrics_write();
        metrics.open_connections = metrics.open_connections.saturating_sub(1);
    }

    pub fn voice_process_started(&self) {
        let mut metrics = self.metrics_write();
        metrics.voice_processes += 1;
        metrics.total_voice_sessions += 1;
    }

    pub fn voice_process_ended(&self) {
        let mut metrics = self.metrics_write();
        metrics.voice_processes = metrics.voice_processes.saturating_sub(1);
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    ///
    /// Cloning keeps the lock out of response serialisation.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
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

    /// Fraction of failed requests, from 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
