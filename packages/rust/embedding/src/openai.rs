//! OpenAI-compatible HTTP provider.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use lorepath_shared::{LorepathError, ProviderConfig, Result};

use crate::provider::AiProvider;

/// User-Agent string for provider requests.
const USER_AGENT: &str = concat!("Lorepath/", env!("CARGO_PKG_VERSION"));

/// Calls `/embeddings`, `/images/generations` and `/audio/speech`.
pub struct OpenAiProvider {
    config: ProviderConfig,
    api_key: String,
    client: Client,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct ImageResponse {
    data: Vec<ImageData>,
}

#[derive(Deserialize)]
struct ImageData {
    url: Option<String>,
}

impl OpenAiProvider {
    pub fn new(config: ProviderConfig, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| LorepathError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            config,
            api_key,
            client,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(self.endpoint(path))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LorepathError::Network(format!("{path} request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let detail = response.text().await.unwrap_or_default();
        Err(classify_status(path, status, &detail))
    }
}

/// Rate limits and server errors are transient; other refusals are not.
fn classify_status(path: &str, status: StatusCode, detail: &str) -> LorepathError {
    let message = format!("{path} returned HTTP {status}: {}", truncate(detail, 200));
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        LorepathError::Provider(message)
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        LorepathError::config(message)
    } else {
        LorepathError::validation(message)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl AiProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    #[instrument(skip_all, fields(model = %self.config.embedding_model, chars = text.len()))]
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = json!({
            "model": self.config.embedding_model,
            "input": text,
            "dimensions": self.config.dimensions,
        });
        let parsed: EmbeddingResponse = self
            .post("embeddings", body)
            .await?
            .json()
            .await
            .map_err(|e| LorepathError::Provider(format!("malformed embeddings response: {e}")))?;

        let vector = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .unwrap_or_default();
        debug!(dimensions = vector.len(), "embedding received");
        Ok(vector)
    }

    #[instrument(skip_all, fields(model = %self.config.image_model))]
    async fn generate_image(&self, prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.config.image_model,
            "prompt": prompt,
            "n": 1,
            "size": "1024x1024",
        });
        let parsed: ImageResponse = self
            .post("images/generations", body)
            .await?
            .json()
            .await
            .map_err(|e| LorepathError::Provider(format!("malformed image response: {e}")))?;

        parsed
            .data
            .into_iter()
            .find_map(|d| d.url)
            .ok_or_else(|| LorepathError::Provider("image response carried no URL".into()))
    }

    #[instrument(skip_all, fields(model = %self.config.speech_model, voice = %self.config.voice))]
    async fn generate_audio(&self, text: &str) -> Result<Vec<u8>> {
        let body = json!({
            "model": self.config.speech_model,
            "input": text,
            "voice": self.config.voice,
        });
        let bytes = self
            .post("audio/speech", body)
            .await?
            .bytes()
            .await
            .map_err(|e| LorepathError::Network(format!("audio download failed: {e}")))?;
        if bytes.is_empty() {
            return Err(LorepathError::Provider("speech response was empty".into()));
        }
        Ok(bytes.to_vec())
    }
}
