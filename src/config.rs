//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **impl blocks**: Add methods to structs
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER__PORT, APP_LIVE__VOICE, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! The API key for the live endpoint is never stored in the config struct; it is
//! read from `GEMINI_API_KEY` (or `API_KEY`) when a transport is built.

use anyhow::Result;                   // Better error handling with context
use serde::{Deserialize, Serialize};  // For converting to/from TOML, JSON, etc.
use std::env;                         // For reading environment variables

/// Default Gemini Live WebSocket endpoint (the API key is appended as a query parameter).
pub const DEFAULT_LIVE_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (server, live endpoint, audio)
/// makes it easier to understand and maintain as the application grows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub live: LiveConfig,
    pub audio: AudioConfig,
}

/// Local control server settings.
///
/// ## Fields:
/// - `host`: IP address to bind the control API to (keep it on localhost, it drives your microphone)
/// - `port`: TCP port number to listen on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Remote conversational service settings.
///
/// ## Fields:
/// - `endpoint`: WebSocket URL of the bidirectional audio endpoint
/// - `model`: Remote model identifier (with or without the `models/` prefix)
/// - `voice`: Name of the prebuilt synthesized voice
/// - `system_instruction`: Persona and language instruction sent at setup
/// - `setup_timeout_secs`: How long to wait for the server to acknowledge setup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    pub endpoint: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub setup_timeout_secs: u64,
}

/// Which audio I/O implementation backs the microphone and speaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioBackend {
    /// Silent microphone and headless output, for running without sound hardware
    Null,
    /// System default devices through cpal (requires the `cpal` cargo feature)
    Cpal,
}

/// Audio format and metering settings.
///
/// ## Fields:
/// - `input_sample_rate` / `output_sample_rate`: Fixed by the remote service (16 kHz up, 24 kHz down)
/// - `block_size`: Samples per captured microphone block
/// - `outbound_queue_capacity`: Frames buffered between capture and the network sender
/// - `*_volume_stride` / `*_volume_scale`: Subsampling stride and gain of the volume meters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub block_size: usize,
    pub outbound_queue_capacity: usize,
    pub input_volume_stride: usize,
    pub input_volume_scale: f32,
    pub output_volume_stride: usize,
    pub output_volume_scale: f32,
    pub backend: AudioBackend,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),  // Localhost only
                port: 8080,
            },
            live: LiveConfig {
                endpoint: DEFAULT_LIVE_ENDPOINT.to_string(),
                model: "gemini-2.5-flash-native-audio-preview-12-2025".to_string(),
                voice: "Kore".to_string(),
                system_instruction: "Eres \"Sofia\", experta en IA de Innova-IA. Habla con acento Paisa marcado. Sé amable y profesional.".to_string(),
                setup_timeout_secs: 30,
            },
            audio: AudioConfig {
                input_sample_rate: 16000,
                output_sample_rate: 24000,
                block_size: 4096,
                outbound_queue_capacity: 32,   // ~8 seconds of microphone audio at 4096/16k
                input_volume_stride: 50,
                input_volume_scale: 500.0,
                output_volume_stride: 100,
                output_volume_scale: 500.0,
                backend: AudioBackend::Null,
            },
        }
    }
}

impl LiveConfig {
    /// Read the API key from the environment.
    ///
    /// ## Lookup order:
    /// 1. `GEMINI_API_KEY`
    /// 2. `API_KEY`
    ///
    /// Blank values are treated as missing.
    pub fn api_key() -> Option<String> {
        ["GEMINI_API_KEY", "API_KEY"]
            .iter()
            .filter_map(|name| env::var(name).ok())
            .map(|key| key.trim().to_string())
            .find(|key| !key.is_empty())
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST and PORT environment variables
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override the control server port
    /// - `APP_LIVE__VOICE=Puck`: Pick another synthesized voice
    /// - `APP_AUDIO__BACKEND=cpal`: Use real sound devices
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    ///
    /// Sections are separated by a double underscore because field names
    /// themselves contain single underscores.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            // 1. Start with defaults - converts our Default impl to config format
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // 2. Load from config.toml file (if it exists)
            .add_source(config::File::with_name("config").required(false))
            // 3. Load from environment variables with APP_ prefix
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Model, voice and endpoint are not blank
    /// - Sample rates, block size, queue capacity and meter strides are positive
    ///
    /// ## Why validate:
    /// Catching configuration errors early prevents a session from failing
    /// halfway through setup with an obscure device or protocol error.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.live.endpoint.trim().is_empty() {
            return Err(anyhow::anyhow!("Live endpoint cannot be empty"));
        }

        if self.live.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Live model cannot be empty"));
        }

        if self.live.voice.trim().is_empty() {
            return Err(anyhow::anyhow!("Voice name cannot be empty"));
        }

        if self.live.setup_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Setup timeout must be greater than 0"));
        }

        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.block_size == 0 {
            return Err(anyhow::anyhow!("Audio block size must be greater than 0"));
        }

        if self.audio.outbound_queue_capacity == 0 {
            return Err(anyhow::anyhow!("Outbound queue capacity must be greater than 0"));
        }

        if self.audio.input_volume_stride == 0 || self.audio.output_volume_stride == 0 {
            return Err(anyhow::anyhow!("Volume meter strides must be greater than 0"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the session-facing settings can change at runtime: the persona,
    /// the voice, the model and the outbound queue size. For example
    /// `{"live": {"voice": "Puck"}}` changes only the voice. Changes apply to
    /// the next `connect()`; a running session keeps its setup.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(live) = partial_config.get("live") {
            if let Some(model) = live.get("model").and_then(|v| v.as_str()) {
                self.live.model = model.to_string();
            }
            if let Some(voice) = live.get("voice").and_then(|v| v.as_str()) {
                self.live.voice = voice.to_string();
            }
            if let Some(instruction) = live.get("system_instruction").and_then(|v| v.as_str()) {
                self.live.system_instruction = instruction.to_string();
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(capacity) = audio.get("outbound_queue_capacity").and_then(|v| v.as_u64()) {
                self.audio.outbound_queue_capacity = capacity as usize;
            }
            // Parsed so the state layer can refuse it; the backend is fixed at startup
            if let Some(backend) = audio.get("backend") {
                self.audio.backend = serde_json::from_value(backend.clone())?;
            }
        }

        // Validate the updated configuration to ensure it's still valid
        self.validate()?;
        Ok(())
    }
}
