//! # Application State Management
//!
//! State shared by every HTTP handler and every `/ws/call` actor.
//!
//! ## What lives here:
//! - **config**: runtime-updatable configuration
//! - **metrics**: request/error counters, per-endpoint timings, open calls
//! - **conversation**: the turn-exchange service, which owns the session store
//! - **trial**: the trial quota ledger
//!
//! `AppState` is cloned into each worker; the clones share everything
//! through `Arc`. Locks are `std::sync::RwLock` and are only held for the
//! few statements that read or update a value, never across an `.await`.

use crate::config::AppConfig;
use crate::conversation::ConversationService;
use crate::inference::CompletionBackend;
use crate::session::SessionStore;
use crate::trial::TrialLedger;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub conversation: Arc<ConversationService>,
    /// Limits are taken from the configuration at startup.
    pub trial: Arc<TrialLedger>,
    pub start_time: Instant,
}

#[derive(Debug, Default)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Currently open `/ws/call` connections
    pub active_calls: u32,
    /// Total turns exchanged over HTTP and WebSocket
    pub turns_exchanged: u64,
    /// Keyed by `"METHOD /path"`
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, backend: Arc<dyn CompletionBackend>) -> Self {
        let trial = TrialLedger::new(config.trial.clone());
        let conversation = ConversationService::new(Arc::new(SessionStore::new()), backend);

        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            conversation: Arc::new(conversation),
            trial: Arc::new(trial),
            start_time: Instant::now(),
        }
    }

    /// Copy of the current configuration; the lock is released on return.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap() = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().unwrap().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().unwrap().error_count += 1;
    }

    pub fn increment_turns_exchanged(&self) {
        self.metrics.write().unwrap().turns_exchanged += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Reserve a call slot. Returns false when `max_concurrent_calls` are
    /// already open.
    pub fn try_open_call(&self) -> bool {
        let limit = self.config.read().unwrap().performance.max_concurrent_calls;
        let mut metrics = self.metrics.write().unwrap();
        if metrics.active_calls as usize >= limit {
            return false;
        }
        metrics.active_calls += 1;
        true
    }

    pub fn close_call(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.active_calls = metrics.active_calls.saturating_sub(1);
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_calls: metrics.active_calls,
            turns_exchanged: metrics.turns_exchanged,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
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

    /// Share of failed requests, between 0.0 and 1.0.
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
    use super::testing::state_with;
    use super::*;
    use crate::conversation::testing::ScriptedBackend;

    #[test]
    fn call_slots_are_capped() {
        let state = state_with(Arc::new(ScriptedBackend::default()));
        state.config.write().unwrap().performance.max_concurrent_calls = 2;

        assert!(state.try_open_call());
        assert!(state.try_open_call());
        assert!(!state.try_open_call());

        state.close_call();
        assert!(state.try_open_call());
        assert_eq!(state.get_metrics_snapshot().active_calls, 2);
    }

    #[test]
    fn closing_never_underflows() {
        let state = state_with(Arc::new(ScriptedBackend::default()));
        state.close_call();
        assert_eq!(state.get_metrics_snapshot().active_calls, 0);
    }

    #[test]
    fn endpoint_metrics_accumulate() {
        let state = state_with(Arc::new(ScriptedBackend::default()));
        state.record_endpoint_request("POST /chat", 100, false);
        state.record_endpoint_request("POST /chat", 300, true);

        let snapshot = state.get_metrics_snapshot();
        let chat = &snapshot.endpoint_metrics["POST /chat"];
        assert_eq!(chat.average_duration_ms(), 200.0);
        assert_eq!(chat.error_rate(), 0.5);
    }

    #[test]
    fn invalid_config_update_is_rejected() {
        let state = state_with(Arc::new(ScriptedBackend::default()));
        let mut bad = state.get_config();
        bad.turn.long_silence_ms = 1000;
        assert!(state.update_config(bad).is_err());
        assert_eq!(state.get_config().turn.long_silence_ms, 10_000);
    }
}
