//! Text-to-speech through the PlayHT v2 streaming endpoint.
//!
//! The voice is either fixed in configuration or looked up on every call as
//! the first cloned voice on the account. The response body is collected
//! into one buffer so the client gets a single playable message per reply.

use super::Synthesizer;
use crate::adapters::ensure_success;
use crate::config::SynthesisConfig;
use crate::error::SynthesisError;
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
    voice: &'a str,
    output_format: &'a str,
    emotion: &'a str,
    voice_engine: &'a str,
}

#[derive(Debug, Deserialize)]
struct ClonedVoice {
    id: String,
}

fn accept_for(output_format: &str) -> &'static str {
    match output_format {
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        "mulaw" => "audio/basic",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Clone)]
pub struct PlayHtSynthesizer {
    http: Client,
    base_url: String,
    api_key: String,
    user_id: String,
    voice: Option<String>,
    output_format: String,
    emotion: String,
    voice_engine: String,
}

impl PlayHtSynthesizer {
    pub fn new(config: &SynthesisConfig) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().unwrap_or_default(),
            user_id: config.user_id.clone().unwrap_or_default(),
            voice: config.voice.clone(),
            output_format: config.output_format.clone(),
            emotion: config.emotion.clone(),
            voice_engine: config.voice_engine.clone(),
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("AUTHORIZATION", &self.api_key)
            .header("X-USER-ID", &self.user_id)
    }

    async fn resolve_voice(&self) -> Result<String, SynthesisError> {
        if let Some(voice) = &self.voice {
            return Ok(voice.clone());
        }

        let request = self.http.get(format!("{}/cloned-voices", self.base_url));
        let response = self
            .authorized(request)
            .header(ACCEPT, "application/json")
            .send()
            .await?;
        let voices: Vec<ClonedVoice> = ensure_success(response).await?.json().await?;

        voices
            .into_iter()
            .next()
            .map(|voice| voice.id)
            .ok_or(SynthesisError::VoiceUnavailable)
    }
}

#[async_trait]
impl Synthesizer for PlayHtSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, SynthesisError> {
        let voice = self.resolve_voice().await?;
        let body = SpeechRequest {
            text,
            voice: &voice,
            output_format: &self.output_format,
            emotion: &self.emotion,
            voice_engine: &self.voice_engine,
        };

        let request = self.http.post(format!("{}/tts/stream", self.base_url));
        let response = self
            .authorized(request)
            .header(ACCEPT, accept_for(&self.output_format))
            .json(&body)
            .send()
            .await?;
        let audio = ensure_success(response).await?.bytes().await?;

        debug!(chars = text.len(), bytes = audio.len(), %voice, "speech synthesized");
        Ok(audio.to_vec())
    }

    fn model_name(&self) -> &str {
        &self.voice_engine
    }
}
