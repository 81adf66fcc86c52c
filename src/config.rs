//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (`config.toml`, optional)
//! - Environment variables (`APP_SECTION__FIELD`, e.g. `APP_VOICE__VOICE_NAME`)
//! - Platform conventions: `HOST`, `PORT` and `GEMINI_API_KEY`
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` / `GEMINI_API_KEY`
//! 2. `APP_*` environment variables
//! 3. `config.toml`
//! 4. Default values (the `Default` impl)
//!
//! ## Rust Concepts:
//! - **Serde derives**: every section round-trips through the `config` crate and JSON
//! - **Nested structs**: one struct per concern keeps partial updates readable

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Root configuration object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub remote: RemoteConfig,
    pub voice: VoiceConfig,
    pub audio: AudioConfig,
}

/// HTTP control surface binding.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: local control only (default)
/// - `host = "0.0.0.0"`: reachable from other machines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Remote conversational engine connection settings.
///
/// `api_key` is never provisioned by this service; it is read from
/// `GEMINI_API_KEY` or `APP_REMOTE__API_KEY` and is never echoed back by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// WebSocket endpoint of the bidirectional streaming service.
    pub endpoint: String,
    /// Model identifier, without the `models/` prefix.
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    /// Upper bound on session open, in seconds.
    pub connect_timeout_secs: u64,
}

/// Persona of the remote engine for the next call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Prebuilt voice used for synthesized replies.
    pub voice_name: String,
    /// BCP-47 language code of the conversation.
    pub language_code: String,
    /// Opaque instruction text forwarded verbatim at session open.
    pub system_instruction: String,
}

/// Local audio device settings.
///
/// ## Fields:
/// - `input_sample_rate`: rate of frames sent upstream (16 kHz)
/// - `output_sample_rate`: assumed rate of inbound audio when the MIME type has none (24 kHz)
/// - `block_size`: samples per captured frame (256 = 16 ms at 16 kHz)
/// - `input_device` / `output_device`: `"default"` or a device name
/// - `output_gain`: linear playback gain in `[0, 1]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub block_size: usize,
    pub input_device: String,
    pub output_device: String,
    pub output_gain: f32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            remote: RemoteConfig {
                endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                model: "gemini-2.5-flash-preview-native-audio-dialog".to_string(),
                api_key: String::new(),
                connect_timeout_secs: 15,
            },
            voice: VoiceConfig {
                voice_name: "Laomedeia".to_string(),
                language_code: "ar-EG".to_string(),
                system_instruction: "You are a friendly voice assistant. Keep replies short and conversational.".to_string(),
            },
            audio: AudioConfig {
                input_sample_rate: 16_000,
                output_sample_rate: 24_000,
                block_size: 256,
                input_device: "default".to_string(),
                output_device: "default".to_string(),
                output_gain: 1.0,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`
    /// - `APP_VOICE__LANGUAGE_CODE=en-US`
    /// - `APP_AUDIO__INPUT_DEVICE="USB Microphone"`
    /// - `GEMINI_API_KEY=...`
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
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

        if let Ok(key) = env::var("GEMINI_API_KEY") {
            settings = settings.set_override("remote.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.remote.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Remote model must not be empty"));
        }

        if self.remote.connect_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Connect timeout must be greater than 0"));
        }

        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.block_size == 0 {
            return Err(anyhow::anyhow!("Audio block size must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.audio.output_gain) {
            return Err(anyhow::anyhow!("Output gain must be between 0.0 and 1.0"));
        }

        Ok(())
    }

    /// Apply a partial JSON update (used by `PUT /api/v1/config`).
    ///
    /// Only the persona and playback gain are mutable at runtime; device and
    /// rate settings are bound when the process opens its streams. For example
    /// `{"voice": {"language_code": "en-US"}}` changes only the language of the
    /// next call.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(voice) = partial_config.get("voice") {
            if let Some(name) = voice.get("voice_name").and_then(|v| v.as_str()) {
                self.voice.voice_name = name.to_string();
            }
            if let Some(language) = voice.get("language_code").and_then(|v| v.as_str()) {
                self.voice.language_code = language.to_string();
            }
            if let Some(instruction) = voice.get("system_instruction").and_then(|v| v.as_str()) {
                self.voice.system_instruction = instruction.to_string();
            }
        }

        if let Some(remote) = partial_config.get("remote") {
            if let Some(model) = remote.get("model").and_then(|v| v.as_str()) {
                self.remote.model = model.to_string();
            }
            if let Some(timeout) = remote.get("connect_timeout_secs").and_then(|v| v.as_u64()) {
                self.remote.connect_timeout_secs = timeout;
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(gain) = audio.get("output_gain").and_then(|v| v.as_f64()) {
                self.audio.output_gain = gain as f32;
            }
        }

        self.validate()?;
        Ok(())
    }

    /// Full URL for opening a session, with the API key as query parameter.
    pub fn session_url(&self) -> String {
        format!("{}?key={}", self.remote.endpoint, self.remote.api_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.audio.input_sample_rate, 16_000);
        assert_eq!(config.audio.output_sample_rate, 24_000);
        assert_eq!(config.audio.block_size, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.block_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.output_gain = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"voice": {"language_code": "en-US"}, "audio": {"output_gain": 0.5}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.voice.language_code, "en-US");
        assert_eq!(config.audio.output_gain, 0.5);
        // Untouched fields keep their values
        assert_eq!(config.voice.voice_name, "Laomedeia");
        assert_eq!(config.audio.block_size, 256);
    }

    #[test]
    fn test_config_update_rejects_invalid_gain() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"audio": {"output_gain": 3.0}}"#).is_err());
    }

    #[test]
    fn test_session_url_carries_key() {
        let mut config = AppConfig::default();
        config.remote.api_key = "abc".to_string();
        assert!(config.session_url().ends_with("BidiGenerateContent?key=abc"));
    }
}
