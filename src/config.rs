//! # Configuration Management
//!
//! This module loads the relay's configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! The loaded [`AppConfig`] is validated once at startup and handed to the
//! server explicitly (`AppState::new(config)`); nothing reads configuration
//! from ambient globals afterwards.
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `GEMINI_API_KEY`, `HOST` and `PORT` environment variables
//! 2. Environment variables such as `APP_SERVER__PORT` or `APP_UPSTREAM__URL`
//!    (double underscore separates nested keys, so snake_case field names survive)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: derive macros turn these structs into and out of TOML/env values
//! - **Newtype pattern**: [`ApiKey`] wraps a `String` so its `Debug` output can be redacted

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::time::Duration;

/// Default live API endpoint (bidirectional streaming over WebSocket).
pub const DEFAULT_UPSTREAM_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent";

/// Environment variable holding the upstream credential.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub relay: RelayConfig,
}

/// Where the HTTP/WebSocket server listens.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// How to reach and authenticate against the hosted voice API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// `ws://` or `wss://` endpoint; the credential is appended as the `key` query parameter
    pub url: String,
    /// The one required credential. Absent means every session fails.
    pub api_key: Option<ApiKey>,
    pub connect_timeout_secs: u64,
    pub setup_timeout_secs: u64,
    pub setup: SetupConfig,
}

/// The session `setup` message sent right after the upstream connection opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupConfig {
    /// When false the relay sends nothing and the browser sends this setup
    /// itself, as `GET /api/v1/config` hands it over
    pub enabled: bool,
    pub model: String,
    pub response_modalities: Vec<String>,
    pub system_instruction: String,
    pub input_audio_transcription: bool,
    pub output_audio_transcription: bool,
    /// Sent once after setup so the AI speaks first; empty disables it
    pub greeting: String,
}

/// Per-session relay tuning.
///
/// ## Fields:
/// - `max_concurrent_sessions`: connections beyond this are closed with 1013 (try again later)
/// - `downlink_buffer_frames`: frames queued towards a browser before upstream reads pause
/// - `max_frame_bytes`: largest single frame accepted from a browser
/// - `heartbeat_interval_secs` / `client_timeout_secs`: protocol pings to the browser,
///   and how long it may stay silent before the session is dropped
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub max_concurrent_sessions: usize,
    pub downlink_buffer_frames: usize,
    pub max_frame_bytes: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

/// Upstream API key. Never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    #[cfg(test)]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8000,
            },
            upstream: UpstreamConfig {
                url: DEFAULT_UPSTREAM_URL.to_string(),
                api_key: None,
                connect_timeout_secs: 10,
                setup_timeout_secs: 10,
                setup: SetupConfig {
                    enabled: true,
                    model: "models/gemini-2.5-flash-preview-native-audio-dialog".to_string(),
                    response_modalities: vec!["AUDIO".to_string()],
                    system_instruction: "You are a professional AI interviewer. Start by greeting the \
                        interviewee and asking them to introduce themselves. Then ask follow-up questions \
                        about their background, experience, and goals. Keep the conversation natural and \
                        engaging. Speak clearly and at a moderate pace."
                        .to_string(),
                    input_audio_transcription: true,
                    output_audio_transcription: true,
                    greeting: "Hello! Welcome to this interview. Please start by introducing yourself \
                        and telling me a bit about your background."
                        .to_string(),
                },
            },
            relay: RelayConfig {
                max_concurrent_sessions: 32,
                downlink_buffer_frames: 64,
                max_frame_bytes: 1024 * 1024,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    pub fn load() -> Result<Self> {
        Self::load_with(config::File::with_name("config").required(false))
    }

    /// Same layering as [`AppConfig::load`] with a caller-supplied file source.
    fn load_with<S>(file: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        // Deployment platforms set these without the APP_ prefix
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }
        if let Ok(key) = env::var(API_KEY_ENV) {
            settings = settings.set_override("upstream.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Check that the configuration makes sense before the server starts.
    ///
    /// A missing credential is deliberately not an error here: the page and
    /// health endpoints still work, and each session fails on its own.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }

        let url = url::Url::parse(&self.upstream.url)
            .map_err(|e| anyhow!("Upstream url '{}' is invalid: {}", self.upstream.url, e))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(anyhow!("Upstream url must use ws:// or wss://, got {}://", url.scheme()));
        }

        if self.upstream.connect_timeout_secs == 0 || self.upstream.setup_timeout_secs == 0 {
            return Err(anyhow!("Upstream timeouts must be greater than 0"));
        }
        if self.upstream.setup.enabled && self.upstream.setup.model.trim().is_empty() {
            return Err(anyhow!("Upstream setup requires a model name"));
        }

        if self.relay.max_concurrent_sessions == 0 {
            return Err(anyhow!("Max concurrent sessions must be greater than 0"));
        }
        if self.relay.downlink_buffer_frames == 0 {
            return Err(anyhow!("Downlink buffer must hold at least one frame"));
        }
        if self.relay.max_frame_bytes == 0 {
            return Err(anyhow!("Max frame size must be greater than 0"));
        }
        if self.relay.heartbeat_interval_secs == 0
            || self.relay.heartbeat_interval_secs >= self.relay.client_timeout_secs
        {
            return Err(anyhow!(
                "Heartbeat interval ({}s) must be non-zero and shorter than the client timeout ({}s)",
                self.relay.heartbeat_interval_secs,
                self.relay.client_timeout_secs
            ));
        }

        Ok(())
    }

    /// Whether a non-blank credential is configured.
    pub fn has_credential(&self) -> bool {
        self.upstream.api_key.as_ref().is_some_and(|key| !key.is_blank())
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs)
    }
}

impl RelayConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}
