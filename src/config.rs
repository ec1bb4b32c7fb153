//! # Configuration Management
//!
//! Loads application configuration from layered sources:
//! - Default values (built into the code)
//! - Configuration file (config.toml, optional)
//! - Environment variables (with APP__ prefix, `__` between levels)
//! - Deployment shortcuts (HOST, PORT, GEMINI_API_KEY / API_KEY)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. HOST / PORT / GEMINI_API_KEY / API_KEY
//! 2. Environment variables (APP__SERVER__PORT, APP__GENAI__TEXT_MODEL, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impls)
//!
//! ## Why a double-underscore separator:
//! Field names such as `text_model` contain single underscores, so
//! `APP__GENAI__TEXT_MODEL` is the only unambiguous spelling.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;

/// Main application configuration.
///
/// ## Sections:
/// - **server**: where the HTTP server listens
/// - **genai**: hosted model credentials and model names
/// - **live**: streaming voice endpoint and connection heartbeat
/// - **audio**: capture and playback formats
/// - **storage**: where chat history is persisted
/// - **performance**: admission limits
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub genai: GenAiConfig,
    pub live: LiveConfig,
    pub audio: AudioConfig,
    pub storage: StorageConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Hosted model settings for chat, image generation and speech synthesis.
///
/// The API key is read from configuration but never returned by the
/// config endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub text_model: String,
    pub image_model: String,
    pub tts_model: String,
    pub voice_name: String,
    pub request_timeout_secs: u64,
}

impl Default for GenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            text_model: "gemini-2.5-flash".to_string(),
            image_model: "gemini-2.5-flash-image".to_string(),
            tts_model: "gemini-2.5-flash-preview-tts".to_string(),
            voice_name: "Zephyr".to_string(),
            request_timeout_secs: 60,
        }
    }
}

/// Streaming voice endpoint and browser connection heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    pub url: String,
    pub model: String,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            url: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
            model: "gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
            heartbeat_interval_secs: 30,
            client_timeout_secs: 60,
        }
    }
}

/// Audio formats.
///
/// ## Defaults:
/// - **Capture**: 16kHz mono, 4096-sample ticks (~256ms)
/// - **Playback**: 24kHz mono
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub output_channels: u16,
    pub capture_chunk_samples: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            output_channels: 1,
            capture_chunk_samples: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub history_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            history_path: "data/chat_history.json".to_string(),
        }
    }
}

/// Admission limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Live voice sessions allowed at once across all browser connections.
    pub max_concurrent_sessions: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 10,
        }
    }
}

impl AppConfig {
    /// Load configuration from all sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__PORT=3000`: Override server port
    /// - `APP__LIVE__MODEL=...`: Override the live voice model
    /// - `GEMINI_API_KEY=...`: Credential for the hosted model
    /// - `HOST=0.0.0.0` / `PORT=3000`: Deployment platform shortcuts
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Some(key) = api_key_from_env() {
            settings = settings.set_override("genai.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.output_channels == 0 {
            return Err(anyhow::anyhow!("Output channel count must be greater than 0"));
        }

        if self.audio.capture_chunk_samples == 0 {
            return Err(anyhow::anyhow!("Capture chunk size must be greater than 0"));
        }

        if self.live.heartbeat_interval_secs == 0
            || self.live.client_timeout_secs <= self.live.heartbeat_interval_secs
        {
            return Err(anyhow::anyhow!(
                "Client timeout must be longer than a non-zero heartbeat interval"
            ));
        }

        if self.genai.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Request timeout must be greater than 0"));
        }

        Ok(())
    }

    pub fn api_key_configured(&self) -> bool {
        !self.genai.api_key.trim().is_empty()
    }

    /// JSON view for the config endpoint, with the API key replaced by a flag.
    pub fn public_view(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Some(genai) = value.get_mut("genai").and_then(Value::as_object_mut) {
            genai.remove("api_key");
            genai.insert("api_key_configured".to_string(), Value::Bool(self.api_key_configured()));
        }
        value
    }

    /// Apply a partial update given as JSON, then validate.
    ///
    /// ## Partial updates:
    /// Only the fields present are changed, so `{"live": {"model": "x"}}`
    /// leaves everything else alone. On a validation failure `self` is left
    /// untouched. The storage path is fixed for the life of the process.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: Value = serde_json::from_str(json_str)?;
        let mut next = self.clone();

        if let Some(server) = partial.get("server") {
            set_string(server, "host", &mut next.server.host);
            if let Some(port) = server.get("port").and_then(Value::as_u64) {
                next.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Server port out of range: {}", port))?;
            }
        }

        if let Some(genai) = partial.get("genai") {
            set_string(genai, "api_key", &mut next.genai.api_key);
            set_string(genai, "base_url", &mut next.genai.base_url);
            set_string(genai, "text_model", &mut next.genai.text_model);
            set_string(genai, "image_model", &mut next.genai.image_model);
            set_string(genai, "tts_model", &mut next.genai.tts_model);
            set_string(genai, "voice_name", &mut next.genai.voice_name);
            if let Some(secs) = genai.get("request_timeout_secs").and_then(Value::as_u64) {
                next.genai.request_timeout_secs = secs;
            }
        }

        if let Some(live) = partial.get("live") {
            set_string(live, "url", &mut next.live.url);
            set_string(live, "model", &mut next.live.model);
            if let Some(secs) = live.get("heartbeat_interval_secs").and_then(Value::as_u64) {
                next.live.heartbeat_interval_secs = secs;
            }
            if let Some(secs) = live.get("client_timeout_secs").and_then(Value::as_u64) {
                next.live.client_timeout_secs = secs;
            }
        }

        if let Some(audio) = partial.get("audio") {
            if let Some(rate) = audio.get("input_sample_rate").and_then(Value::as_u64) {
                next.audio.input_sample_rate = u32::try_from(rate)?;
            }
            if let Some(rate) = audio.get("output_sample_rate").and_then(Value::as_u64) {
                next.audio.output_sample_rate = u32::try_from(rate)?;
            }
            if let Some(channels) = audio.get("output_channels").and_then(Value::as_u64) {
                next.audio.output_channels = u16::try_from(channels)?;
            }
            if let Some(chunk) = audio.get("capture_chunk_samples").and_then(Value::as_u64) {
                next.audio.capture_chunk_samples = chunk as usize;
            }
        }

        if let Some(performance) = partial.get("performance") {
            if let Some(sessions) = performance.get("max_concurrent_sessions").and_then(Value::as_u64) {
                next.performance.max_concurrent_sessions = sessions as usize;
            }
        }

        next.validate()?;
        *self = next;
        Ok(())
    }
}

fn set_string(section: &Value, key: &str, target: &mut String) {
    if let Some(value) = section.get(key).and_then(Value::as_str) {
        *target = value.to_string();
    }
}

fn api_key_from_env() -> Option<String> {
    ["GEMINI_API_KEY", "API_KEY"]
        .iter()
        .filter_map(|name| env::var(name).ok())
        .map(|key| key.trim().to_string())
        .find(|key| !key.is_empty())
}
