//! Speech-to-text through the OpenAI transcription endpoint.
//!
//! The client's buffer is uploaded as-is; the configured [`AudioFormat`]
//! decides the file name and MIME type the backend uses to decode it.

use super::{ensure_success, AudioFormat, OpenAiClient, Transcriber};
use crate::config::TranscriptionConfig;
use crate::error::TranscriptionError;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct WhisperTranscriber {
    client: OpenAiClient,
    model: String,
    language: String,
}

impl WhisperTranscriber {
    pub fn new(client: OpenAiClient, config: &TranscriptionConfig) -> Self {
        Self {
            client,
            model: config.model.clone(),
            language: config.language.clone(),
        }
    }

    fn form(&self, audio: &[u8], format: AudioFormat) -> Result<Form, TranscriptionError> {
        let file = Part::bytes(audio.to_vec())
            .file_name(format!("audio.{}", format.extension()))
            .mime_str(format.mime())?;

        Ok(Form::new()
            .part("file", file)
            .text("model", self.model.clone())
            .text("language", self.language.clone())
            .text("response_format", "text"))
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, audio: &[u8], format: AudioFormat) -> Result<String, TranscriptionError> {
        if audio.is_empty() {
            return Ok(String::new());
        }

        let response = self
            .client
            .post("audio/transcriptions")
            .multipart(self.form(audio, format)?)
            .send()
            .await?;
        let text = ensure_success(response).await?.text().await?;

        debug!(bytes = audio.len(), chars = text.len(), "transcription received");
        Ok(text.trim().to_string())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::loopback;
    use crate::config::AppConfig;
    use actix_web::{web, HttpRequest, HttpResponse};

    fn transcriber_at(base_url: String) -> WhisperTranscriber {
        let mut config = AppConfig::default();
        config.openai.base_url = base_url;
        config.openai.api_key = Some("sk-test".to_string());
        WhisperTranscriber::new(OpenAiClient::new(&config.openai).unwrap(), &config.transcription)
    }

    async fn transcription(req: HttpRequest, body: web::Bytes) -> HttpResponse {
        let auth = req.headers().get("Authorization").and_then(|v| v.to_str().ok());
        let content_type = req
            .headers()
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let body = String::from_utf8_lossy(&body).to_lowercase();

        if auth != Some("Bearer sk-test") {
            return HttpResponse::Unauthorized().body("bad key");
        }
        if !content_type.starts_with("multipart/form-data") {
            return HttpResponse::BadRequest().body("not multipart");
        }
        for expected in [
            r#"filename="audio.ogg""#,
            "content-type: audio/ogg",
            "whisper-1",
            r#"name="response_format""#,
            "oggs-fake-bytes",
        ] {
            if !body.contains(expected) {
                return HttpResponse::BadRequest().body(format!("missing {expected}"));
            }
        }
        HttpResponse::Ok().content_type("text/plain").body("  Hello there.\n")
    }

    #[actix_web::test]
    async fn test_upload_returns_trimmed_text() {
        let base_url = loopback::serve(|cfg: &mut web::ServiceConfig| {
            cfg.route("/audio/transcriptions", web::post().to(transcription));
        });
        let transcriber = transcriber_at(base_url);

        let text = transcriber.transcribe(b"OggS-fake-bytes", AudioFormat::Ogg).await.unwrap();

        assert_eq!(text, "Hello there.");
    }

    #[actix_web::test]
    async fn test_backend_error_is_reported_with_status() {
        let base_url = loopback::serve(|cfg: &mut web::ServiceConfig| {
            cfg.route(
                "/audio/transcriptions",
                web::post().to(|| async { HttpResponse::InternalServerError().body("model overloaded") }),
            );
        });
        let transcriber = transcriber_at(base_url);

        let err = transcriber.transcribe(b"audio", AudioFormat::Webm).await.unwrap_err();

        match err {
            TranscriptionError::Api(failure) => {
                assert_eq!(failure.status, 500);
                assert_eq!(failure.body, "model overloaded");
            }
            other => panic!("expected an api failure, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_empty_audio_skips_the_backend() {
        let config = AppConfig::default();
        let client = OpenAiClient::new(&config.openai).unwrap();
        let transcriber = WhisperTranscriber::new(client, &config.transcription);

        // No key and no server: an attempted request would fail.
        let text = transcriber.transcribe(&[], AudioFormat::Webm).await.unwrap();
        assert_eq!(text, "");
    }
}
