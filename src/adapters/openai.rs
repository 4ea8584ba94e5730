//! Shared HTTP handle for the OpenAI-compatible endpoints.
//!
//! Adapters receive an explicit [`OpenAiClient`] when they are built, so
//! there is no process-wide client or key. Cloning is cheap: `reqwest::Client`
//! is reference-counted internally.

use crate::config::OpenAiConfig;
use reqwest::{Client, RequestBuilder};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(config: &OpenAiConfig) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().unwrap_or_default(),
        })
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn get(&self, path: &str) -> RequestBuilder {
        self.http.get(self.endpoint(path)).bearer_auth(&self.api_key)
    }

    pub fn post(&self, path: &str) -> RequestBuilder {
        self.http.post(self.endpoint(path)).bearer_auth(&self.api_key)
    }
}
