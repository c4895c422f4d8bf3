//! # Configuration Management
//!
//! Loads application configuration from several layered sources:
//! - Default values (built into the code)
//! - An optional `config.toml`
//! - Environment variables with the `APP_` prefix
//! - `HOST`/`PORT` and `GROQ_API_KEY`, as deployment platforms set them
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST`, `PORT`, `GROQ_API_KEY`
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_TURN__SHORT_SILENCE_MS`, ...)
//! 3. Configuration file (`config.toml`)
//! 4. Default values (the `Default` impl)
//!
//! ## Sections:
//! - **server**: bind address
//! - **inference**: OpenAI-compatible completion provider
//! - **turn**: silence thresholds of the turn-taking controller
//! - **trial**: trial chat and trial call allowances
//! - **performance**: concurrency limits

use crate::turn::TurnConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub inference: InferenceConfig,
    pub turn: TurnSettings,
    pub trial: TrialConfig,
    pub performance: PerformanceConfig,
}

/// Where the HTTP server listens.
///
/// - `host = "127.0.0.1"`: local development only
/// - `host = "0.0.0.0"`: accept connections on every interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Chat-completion provider settings.
///
/// Any OpenAI-compatible endpoint works; the defaults point at Groq.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    pub base_url: String,
    pub model: String,
    /// Bearer token. Falls back to `GROQ_API_KEY` when unset.
    #[serde(default)]
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

/// Silence thresholds, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnSettings {
    /// Silence after the last partial before the utterance is sent
    pub short_silence_ms: u64,
    /// Silence with nothing captured before listening pauses
    pub long_silence_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialConfig {
    pub chat_message_limit: u32,
    pub call_max_sessions: u32,
    pub call_limit_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Upper bound on simultaneously open `/ws/call` connections
    pub max_concurrent_calls: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            inference: InferenceConfig {
                base_url: "https://api.groq.com/openai/v1".to_string(),
                model: "llama-3.1-8b-instant".to_string(),
                api_key: None,
                timeout_secs: 30,
            },
            turn: TurnSettings {
                short_silence_ms: 4500,
                long_silence_ms: 10_000,
            },
            trial: TrialConfig::default(),
            performance: PerformanceConfig {
                max_concurrent_calls: 50,
            },
        }
    }
}

impl Default for TrialConfig {
    fn default() -> Self {
        Self {
            chat_message_limit: 50,
            call_max_sessions: 5,
            call_limit_secs: 300,
        }
    }
}

impl TurnSettings {
    /// Controller thresholds for a call. Trial calls also carry a hard limit.
    pub fn turn_config(&self, call_limit: Option<Duration>) -> TurnConfig {
        TurnConfig {
            short_silence: Duration::from_millis(self.short_silence_ms),
            long_silence: Duration::from_millis(self.long_silence_ms),
            call_limit,
        }
    }
}

impl AppConfig {
    /// Load configuration from every source in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`
    /// - `APP_INFERENCE__MODEL=llama-3.3-70b-versatile`
    /// - `APP_TRIAL__CALL_LIMIT_SECS=600`
    /// - `PORT=3000`, `GROQ_API_KEY=...`
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // `__` separates section from field, since field names contain `_`
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let mut config: AppConfig = settings.build()?.try_deserialize()?;

        if config.inference.api_key.as_deref().map_or(true, str::is_empty) {
            config.inference.api_key = env::var("GROQ_API_KEY").ok();
        }

        Ok(config)
    }

    /// Reject configurations the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_calls == 0 {
            return Err(anyhow::anyhow!("Max concurrent calls must be greater than 0"));
        }

        if self.inference.timeout_secs == 0 {
            return Err(anyhow::anyhow!("Inference timeout must be greater than 0"));
        }

        if self.turn.short_silence_ms == 0 {
            return Err(anyhow::anyhow!("Short silence threshold must be greater than 0"));
        }

        if self.turn.short_silence_ms >= self.turn.long_silence_ms {
            return Err(anyhow::anyhow!(
                "Short silence threshold ({}ms) must be below the long silence threshold ({}ms)",
                self.turn.short_silence_ms,
                self.turn.long_silence_ms
            ));
        }

        if self.trial.chat_message_limit == 0 || self.trial.call_limit_secs == 0 {
            return Err(anyhow::anyhow!("Trial limits must be greater than 0"));
        }

        Ok(())
    }

    /// Copy safe to hand out over HTTP: the API key is masked.
    pub fn redacted(&self) -> AppConfig {
        let mut copy = self.clone();
        if copy.inference.api_key.is_some() {
            copy.inference.api_key = Some("********".to_string());
        }
        copy
    }

    /// Apply a partial update, e.g. `{"turn": {"short_silence_ms": 3000}}`.
    ///
    /// Only the fields present are changed, and the result is validated
    /// before it is accepted. The API key cannot be changed this way.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;
        let mut next = self.clone();

        if let Some(server) = partial.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                next.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                next.server.port = u16::try_from(port)?;
            }
        }

        if let Some(inference) = partial.get("inference") {
            if let Some(model) = inference.get("model").and_then(|v| v.as_str()) {
                next.inference.model = model.to_string();
            }
            if let Some(timeout) = inference.get("timeout_secs").and_then(|v| v.as_u64()) {
                next.inference.timeout_secs = timeout;
            }
        }

        if let Some(turn) = partial.get("turn") {
            if let Some(ms) = turn.get("short_silence_ms").and_then(|v| v.as_u64()) {
                next.turn.short_silence_ms = ms;
            }
            if let Some(ms) = turn.get("long_silence_ms").and_then(|v| v.as_u64()) {
                next.turn.long_silence_ms = ms;
            }
        }

        if let Some(trial) = partial.get("trial") {
            if let Some(limit) = trial.get("chat_message_limit").and_then(|v| v.as_u64()) {
                next.trial.chat_message_limit = u32::try_from(limit)?;
            }
            if let Some(sessions) = trial.get("call_max_sessions").and_then(|v| v.as_u64()) {
                next.trial.call_max_sessions = u32::try_from(sessions)?;
            }
            if let Some(secs) = trial.get("call_limit_secs").and_then(|v| v.as_u64()) {
                next.trial.call_limit_secs = secs;
            }
        }

        if let Some(performance) = partial.get("performance") {
            if let Some(calls) = performance.get("max_concurrent_calls").and_then(|v| v.as_u64()) {
                next.performance.max_concurrent_calls = calls as usize;
            }
        }

        next.validate()?;
        *self = next;
        Ok(())
    }
}
