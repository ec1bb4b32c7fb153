//! # Application State Management
//!
//! Shared state handed to every request handler and WebSocket actor.
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: many handlers hold a reference to the same data
//! - **RwLock**: many readers OR one writer
//!
//! Locks are only held for the duration of a copy or a counter update, never
//! across an `.await`. A poisoned lock is recovered rather than propagated:
//! every value behind one is valid after any partial update.

use crate::config::AppConfig;
use crate::genai::GenAiClient;
use crate::history::HistoryStore;
use crate::live::gemini::{GeminiLiveConnector, GeminiLiveSettings};
use crate::live::manager::LiveConnector;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request and live-session counters
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Hosted model client, rebuilt whenever its settings change
    pub genai: Arc<RwLock<GenAiClient>>,

    pub history: Arc<HistoryStore>,

    pub start_time: Instant,
}

/// Metrics collected across all requests.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of errors encountered since server start
    pub error_count: u64,

    /// Open `/ws/live` browser connections
    pub connected_clients: u32,

    /// Live voice sessions currently holding an admission slot
    pub active_live_sessions: u32,

    /// Live sessions admitted since server start
    pub live_sessions_started: u64,

    /// Start requests refused by the session limit
    pub live_sessions_rejected: u64,

    /// Key: "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
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
    pub fn new(config: AppConfig) -> Self {
        let genai = GenAiClient::new(config.genai.clone());
        let history = HistoryStore::new(config.storage.history_path.clone());
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            genai: Arc::new(RwLock::new(genai)),
            history: Arc::new(history),
            start_time: Instant::now(),
        }
    }

    /// Copy of the current configuration. Cloning releases the lock at once.
    pub fn get_config(&self) -> AppConfig {
        read(&self.config).clone()
    }

    /// Replace the configuration after validating it. A changed `genai`
    /// section rebuilds the client so new credentials apply to the next call.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;

        let genai = GenAiClient::new(new_config.genai.clone());
        *write(&self.config) = new_config;
        *write(&self.genai) = genai;
        Ok(())
    }

    /// Merge a partial JSON update into the live configuration. The merge
    /// runs under the config write lock, so concurrent updates each see the
    /// result of the previous one. Returns the configuration now in effect.
    pub fn apply_config_update(&self, json_str: &str) -> Result<AppConfig, String> {
        let mut config = write(&self.config);
        config.update_from_json(json_str).map_err(|e| e.to_string())?;

        let updated = config.clone();
        *write(&self.genai) = GenAiClient::new(updated.genai.clone());
        Ok(updated)
    }

    pub fn genai_client(&self) -> GenAiClient {
        read(&self.genai).clone()
    }

    /// Connector for a new live session, using the settings current at the
    /// moment the session starts.
    pub fn live_connector(&self) -> Arc<dyn LiveConnector> {
        let config = self.get_config();
        Arc::new(GeminiLiveConnector::new(GeminiLiveSettings {
            url: config.live.url,
            api_key: config.genai.api_key,
            model: config.live.model,
            voice_name: config.genai.voice_name,
            output_sample_rate: config.audio.output_sample_rate,
            output_channels: config.audio.output_channels,
        }))
    }

    pub fn increment_request_count(&self) {
        write(&self.metrics).request_count += 1;
    }

    pub fn increment_error_count(&self) {
        write(&self.metrics).error_count += 1;
    }

    /// Record one request against its endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = write(&self.metrics);
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn client_connected(&self) {
        write(&self.metrics).connected_clients += 1;
    }

    pub fn client_disconnected(&self) {
        let mut metrics = write(&self.metrics);
        metrics.connected_clients = metrics.connected_clients.saturating_sub(1);
    }

    /// Take a live-session slot if one is free. Check and increment happen
    /// under one write lock, so two racing starts cannot both pass at the limit.
    pub fn try_acquire_live_session(&self) -> bool {
        let limit = read(&self.config).performance.max_concurrent_sessions;
        let mut metrics = write(&self.metrics);

        if metrics.active_live_sessions as usize >= limit {
            metrics.live_sessions_rejected += 1;
            return false;
        }

        metrics.active_live_sessions += 1;
        metrics.live_sessions_started += 1;
        true
    }

    pub fn release_live_session(&self) {
        let mut metrics = write(&self.metrics);
        metrics.active_live_sessions = metrics.active_live_sessions.saturating_sub(1);
    }

    /// Consistent copy of the metrics for serialization.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = read(&self.metrics);
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            connected_clients: metrics.connected_clients,
            active_live_sessions: metrics.active_live_sessions,
            live_sessions_started: metrics.live_sessions_started,
            live_sessions_rejected: metrics.live_sessions_rejected,
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

    /// Fraction of requests that failed, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// State whose history file lives in a fresh temporary directory.
    pub fn temp_state(config: AppConfig) -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config;
        config.storage.history_path = dir
            .path()
            .join("history.json")
            .to_string_lossy()
            .into_owned();
        (dir, AppState::new(config))
    }
}
