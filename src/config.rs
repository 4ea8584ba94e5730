//! # Configuration Management
//!
//! Configuration is layered from several sources:
//! - Default values (the `Default` impl below)
//! - An optional `config.toml` in the working directory
//! - Environment variables with the `APP_` prefix
//! - A handful of conventional deployment variables (`HOST`, `PORT`, API keys)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST`, `PORT`, `OPENAI_API_KEY`, `PLAYHT_API_KEY`, `PLAYHT_USER_ID`
//! 2. `APP_` variables, with `__` between nested keys
//!    (e.g. `APP_DIALOGUE__MODEL=gpt-4o-mini`, `APP_SESSION__GREETING=Hi!`)
//! 3. `config.toml`
//! 4. Defaults
//!
//! ## Rust Concepts Used:
//! - **Serde**: the same structs are serialized (to seed the defaults layer)
//!   and deserialized (from the merged layers)
//! - **Option<T>**: settings that may legitimately be absent, like API keys
//!   or a fixed voice id

use crate::adapters::{AudioFormat, Persona};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Placeholder shown instead of secrets in the public config view.
const REDACTED: &str = "***";

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub openai: OpenAiConfig,
    pub transcription: TranscriptionConfig,
    pub dialogue: DialogueConfig,
    pub synthesis: SynthesisConfig,
}

/// Where the HTTP server listens.
///
/// - `host = "127.0.0.1"`: only local clients (development)
/// - `host = "0.0.0.0"`: any interface (containers, production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Per-connection behaviour of the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Encoding of the audio the client sends, forwarded to transcription
    pub audio_format: AudioFormat,
    /// Spoken once when a session opens, before any client input
    pub greeting: Option<String>,
    /// Upgrades beyond this many live sessions are refused with 503
    pub max_concurrent_sessions: usize,
    /// Largest client audio message, after reassembling fragments
    pub max_message_bytes: usize,
    /// Complete audio messages allowed to wait while a turn is in flight
    pub inbound_queue_depth: usize,
    pub heartbeat_interval_secs: u64,
    /// A client silent for longer than this is treated as disconnected
    pub client_timeout_secs: u64,
    /// How long shutdown waits for sessions to say goodbye
    pub shutdown_grace_ms: u64,
}

/// Connection details shared by the OpenAI-backed adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    /// Applies to each HTTP call, not to a whole reply generation
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    pub model: String,
    pub language: String,
}

/// The conversational persona and how its replies are awaited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueConfig {
    pub model: String,
    pub persona_name: String,
    pub instructions: String,
    /// First wait between run-status checks; doubles up to the max
    pub poll_initial_interval_ms: u64,
    pub poll_max_interval_ms: u64,
}

/// PlayHT text-to-speech settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    pub api_key: Option<String>,
    pub user_id: Option<String>,
    pub base_url: String,
    /// Fixed voice id; when unset the first cloned voice on the account is used
    pub voice: Option<String>,
    pub output_format: String,
    pub emotion: String,
    pub voice_engine: String,
    pub request_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8000,
            },
            session: SessionConfig {
                audio_format: AudioFormat::Webm,
                greeting: None,
                max_concurrent_sessions: 10,
                max_message_bytes: 8 * 1024 * 1024,
                inbound_queue_depth: 8,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
                shutdown_grace_ms: 5_000,
            },
            openai: OpenAiConfig {
                api_key: None,
                base_url: "https://api.openai.com/v1".to_string(),
                request_timeout_secs: 60,
            },
            transcription: TranscriptionConfig {
                model: "whisper-1".to_string(),
                language: "en".to_string(),
            },
            dialogue: DialogueConfig {
                model: "gpt-3.5-turbo".to_string(),
                persona_name: "Roger Federer".to_string(),
                instructions: "You are Roger Federer. You are having a conversation with a friend \
                    who you have inspired to play tennis. Interact with them with warmth, kindness, \
                    and like you're having a conversation with him."
                    .to_string(),
                poll_initial_interval_ms: 250,
                poll_max_interval_ms: 2_000,
            },
            synthesis: SynthesisConfig {
                api_key: None,
                user_id: None,
                base_url: "https://api.play.ht/api/v2".to_string(),
                voice: None,
                output_format: "mp3".to_string(),
                emotion: "male_happy".to_string(),
                voice_engine: "PlayHT2.0-turbo".to_string(),
                request_timeout_secs: 60,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from every source in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`
    /// - `APP_SESSION__AUDIO_FORMAT=ogg`
    /// - `PORT=3000` (deployment platforms)
    /// - `OPENAI_API_KEY=sk-...`
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        let overrides = [
            ("HOST", "server.host"),
            ("PORT", "server.port"),
            ("OPENAI_API_KEY", "openai.api_key"),
            ("PLAYHT_API_KEY", "synthesis.api_key"),
            ("PLAYHT_USER_ID", "synthesis.user_id"),
        ];
        for (var, key) in overrides {
            if let Ok(value) = env::var(var) {
                settings = settings.set_override(key, value)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject settings the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.session.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.session.max_message_bytes == 0 {
            return Err(anyhow::anyhow!("Max message size must be greater than 0"));
        }

        if self.session.inbound_queue_depth == 0 {
            return Err(anyhow::anyhow!("Inbound queue depth must be greater than 0"));
        }

        if self.session.client_timeout_secs <= self.session.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "Client timeout must be longer than the heartbeat interval"
            ));
        }

        if self.dialogue.instructions.trim().is_empty() {
            return Err(anyhow::anyhow!("Persona instructions cannot be empty"));
        }

        if self.dialogue.poll_initial_interval_ms == 0
            || self.dialogue.poll_initial_interval_ms > self.dialogue.poll_max_interval_ms
        {
            return Err(anyhow::anyhow!(
                "Poll interval must be positive and no larger than the max poll interval"
            ));
        }

        Ok(())
    }

    /// Missing credentials are not fatal at startup (health and config
    /// endpoints still work) but every session will fail without them.
    pub fn credential_warnings(&self) -> Vec<&'static str> {
        let mut warnings = Vec::new();
        if self.openai.api_key.is_none() {
            warnings.push("OPENAI_API_KEY is not set; transcription and dialogue calls will be rejected");
        }
        if self.synthesis.api_key.is_none() {
            warnings.push("PLAYHT_API_KEY is not set; speech synthesis calls will be rejected");
        }
        if self.synthesis.user_id.is_none() {
            warnings.push("PLAYHT_USER_ID is not set; speech synthesis calls will be rejected");
        }
        warnings
    }

    /// Copy of the configuration that is safe to show over HTTP.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        let hide = |secret: &mut Option<String>| {
            if secret.is_some() {
                *secret = Some(REDACTED.to_string());
            }
        };
        hide(&mut copy.openai.api_key);
        hide(&mut copy.synthesis.api_key);
        hide(&mut copy.synthesis.user_id);
        copy
    }
}

impl DialogueConfig {
    pub fn persona(&self) -> Persona {
        Persona {
            name: self.persona_name.clone(),
            instructions: self.instructions.clone(),
            model: self.model.clone(),
        }
    }
}
