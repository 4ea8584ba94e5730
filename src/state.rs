//! # Application State Management
//!
//! State shared by every HTTP handler and every session task:
//! - the loaded configuration (read-only after startup)
//! - the session [`Gateway`], which carries the adapters
//! - the shutdown signal
//! - request and session metrics
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> for metrics
//! Many workers update counters at once. `RwLock` lets readers share and
//! writers take turns. A panic while holding the lock "poisons" it; metrics
//! are plain counters, so we keep going with the inner value
//! (`PoisonError::into_inner`) instead of propagating the panic.
//!
//! ### RAII permits
//! [`SessionPermit`] holds one slot of the concurrent-session budget and
//! gives it back in `Drop`. Whatever path a connection takes (upgrade
//! failure, setup failure, normal end) the slot is released exactly once.
//!
//! ### watch channel for shutdown
//! One `watch::Sender<bool>`; every session holds a receiver and reacts the
//! moment it flips to `true`.

use crate::adapters::Adapters;
use crate::config::AppConfig;
use crate::pipeline::{Gateway, SessionOutcome, SessionReport, SessionSettings};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct AppState {
    config: Arc<AppConfig>,
    metrics: Arc<RwLock<AppMetrics>>,
    gateway: Gateway,
    shutdown: Arc<watch::Sender<bool>>,
    pub start_time: Instant,
}

/// Counters exposed by the health and metrics endpoints.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Sessions currently holding a permit
    pub active_sessions: usize,
    /// Upgrades refused because the limit was reached
    pub sessions_rejected: u64,
    pub sessions_opened: u64,
    pub setup_failures: u64,
    pub sessions_failed: u64,
    pub sessions_client_closed: u64,
    pub sessions_shut_down: u64,
    pub turns_completed: u64,
    /// Failed sessions keyed by the stage that failed
    pub failures_by_stage: HashMap<&'static str, u64>,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// One reserved session slot; released on drop.
#[derive(Debug)]
pub struct SessionPermit {
    metrics: Arc<RwLock<AppMetrics>>,
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.active_sessions = metrics.active_sessions.saturating_sub(1);
    }
}

impl AppState {
    pub fn new(config: AppConfig, adapters: Adapters) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let gateway = Gateway::new(adapters, SessionSettings::from_config(&config), shutdown_rx);

        Self {
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            gateway,
            shutdown: Arc::new(shutdown),
            start_time: Instant::now(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn gateway(&self) -> Gateway {
        self.gateway.clone()
    }

    fn metrics_read(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics_write(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim a session slot, or `None` if the limit is reached.
    pub fn try_reserve_session(&self) -> Option<SessionPermit> {
        let mut metrics = self.metrics_write();
        if metrics.active_sessions >= self.config.session.max_concurrent_sessions {
            metrics.sessions_rejected += 1;
            return None;
        }
        metrics.active_sessions += 1;
        Some(SessionPermit {
            metrics: Arc::clone(&self.metrics),
        })
    }

    pub fn active_sessions(&self) -> usize {
        self.metrics_read().active_sessions
    }

    pub fn record_session(&self, report: &SessionReport) {
        let mut metrics = self.metrics_write();
        metrics.turns_completed += report.turns_completed;

        if report.opened {
            metrics.sessions_opened += 1;
        }
        match &report.outcome {
            SessionOutcome::SetupFailed => metrics.setup_failures += 1,
            SessionOutcome::ClientClosed => metrics.sessions_client_closed += 1,
            SessionOutcome::Shutdown => metrics.sessions_shut_down += 1,
            SessionOutcome::Failed { stage } => {
                metrics.sessions_failed += 1;
                *metrics.failures_by_stage.entry(*stage).or_default() += 1;
            }
        }
    }

    /// Tell every session to wind down and stop admitting new ones.
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Wait until no session holds a permit, or `grace` elapses.
    /// Returns whether every session finished in time.
    pub async fn wait_for_sessions_to_drain(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        while self.active_sessions() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }

    pub fn increment_request_count(&self) {
        self.metrics_write().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_write().error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_write();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

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

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
