//! # Backend Adapters
//!
//! The relay talks to three external capabilities. Each one sits behind a
//! trait so the session logic never sees HTTP, and tests can swap in fakes:
//!
//! - [`Transcriber`]: audio bytes in, text out
//! - [`Dialogue`]: owns conversation identities and produces replies
//! - [`Synthesizer`]: text in, audio bytes out
//!
//! Every call either returns a complete value or fails with the adapter's
//! own error type. Adapters do not retry.
//!
//! ## Rust Concepts
//! - **async-trait**: async methods in traits that are used as `dyn Trait`
//! - **Arc<dyn Trait>**: one adapter instance shared by all sessions; the
//!   `Send + Sync` bounds make that sharing thread-safe

pub mod assistant;
pub mod openai;
pub mod playht;
pub mod whisper;

#[cfg(test)]
pub(crate) mod loopback;

use crate::config::AppConfig;
use crate::error::{ApiFailure, DialogueError, SynthesisError, TranscriptionError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub use assistant::{AssistantDialogue, PollBackoff};
pub use openai::OpenAiClient;
pub use playht::PlayHtSynthesizer;
pub use whisper::WhisperTranscriber;

/// Encoding of a complete audio buffer sent by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Webm,
    Ogg,
    Mp3,
    Mp4,
    Wav,
}

impl AudioFormat {
    pub fn extension(self) -> &'static str {
        match self {
            AudioFormat::Webm => "webm",
            AudioFormat::Ogg => "ogg",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Mp4 => "mp4",
            AudioFormat::Wav => "wav",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            AudioFormat::Webm => "audio/webm",
            AudioFormat::Ogg => "audio/ogg",
            AudioFormat::Mp3 => "audio/mpeg",
            AudioFormat::Mp4 => "audio/mp4",
            AudioFormat::Wav => "audio/wav",
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Who the language model plays during a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Persona {
    pub name: String,
    pub instructions: String,
    pub model: String,
}

/// Opaque handle for one conversation held by a [`Dialogue`] backend.
///
/// Only the adapter that issued it can interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogueId(String);

impl DialogueId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DialogueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Speech-to-text.
#[async_trait]
pub trait Transcriber: Send + Sync + 'static {
    /// Transcribe one complete buffer. Silence or unintelligible audio
    /// yields an empty string rather than an error.
    async fn transcribe(&self, audio: &[u8], format: AudioFormat) -> Result<String, TranscriptionError>;

    /// Model name for logging and health output
    fn model_name(&self) -> &str;
}

/// Conversational language model with server-side conversation state.
#[async_trait]
pub trait Dialogue: Send + Sync + 'static {
    /// Allocate a fresh conversation for one session.
    async fn create_identity(&self, persona: &Persona) -> Result<DialogueId, DialogueError>;

    /// Add the user's words to the conversation and wait for the reply.
    /// May take arbitrarily long; callers cancel by dropping the future.
    async fn generate_reply(&self, id: &DialogueId, user_text: &str) -> Result<String, DialogueError>;

    fn model_name(&self) -> &str;
}

/// Text-to-speech.
#[async_trait]
pub trait Synthesizer: Send + Sync + 'static {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, SynthesisError>;

    fn model_name(&self) -> &str;
}

/// The three adapters a session needs, shared between sessions.
#[derive(Clone)]
pub struct Adapters {
    pub transcriber: Arc<dyn Transcriber>,
    pub dialogue: Arc<dyn Dialogue>,
    pub synthesizer: Arc<dyn Synthesizer>,
}

impl Adapters {
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        dialogue: Arc<dyn Dialogue>,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> Self {
        Self {
            transcriber,
            dialogue,
            synthesizer,
        }
    }

    /// Build the HTTP-backed adapters: Whisper, the Assistants API and PlayHT.
    pub fn from_config(config: &AppConfig) -> Result<Self, reqwest::Error> {
        let openai = OpenAiClient::new(&config.openai)?;

        Ok(Self::new(
            Arc::new(WhisperTranscriber::new(openai.clone(), &config.transcription)),
            Arc::new(AssistantDialogue::new(openai, &config.dialogue)),
            Arc::new(PlayHtSynthesizer::new(&config.synthesis)?),
        ))
    }
}

impl fmt::Debug for Adapters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapters")
            .field("transcriber", &self.transcriber.model_name())
            .field("dialogue", &self.dialogue.model_name())
            .field("synthesizer", &self.synthesizer.model_name())
            .finish()
    }
}

/// Pass successful responses through; turn anything else into [`ApiFailure`].
pub(crate) async fn ensure_success(
    response: reqwest::Response,
) -> Result<reqwest::Response, ApiFailure> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiFailure::new(status.as_u16(), &body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_format_names() {
        assert_eq!(AudioFormat::Webm.extension(), "webm");
        assert_eq!(AudioFormat::Mp3.mime(), "audio/mpeg");
        assert_eq!(AudioFormat::Ogg.to_string(), "ogg");

        let parsed: AudioFormat = serde_json::from_str("\"wav\"").unwrap();
        assert_eq!(parsed, AudioFormat::Wav);
    }

    #[test]
    fn test_dialogue_id_is_opaque_text() {
        let id = DialogueId::new("asst_1:thread_9");
        assert_eq!(id.as_str(), "asst_1:thread_9");
        assert_eq!(id.to_string(), "asst_1:thread_9");
        assert_ne!(id, DialogueId::new("asst_1:thread_8"));
    }

    #[test]
    fn test_adapters_from_default_config() {
        let adapters = Adapters::from_config(&AppConfig::default()).unwrap();
        assert_eq!(adapters.transcriber.model_name(), "whisper-1");
        assert_eq!(adapters.dialogue.model_name(), "gpt-3.5-turbo");
        assert_eq!(adapters.synthesizer.model_name(), "PlayHT2.0-turbo");
    }
}
