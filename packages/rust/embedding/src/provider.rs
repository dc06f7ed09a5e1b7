//! AI provider abstraction and the local hashing backend.

use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use lorepath_shared::{LorepathError, ProviderConfig, ProviderKind, Result};

use crate::openai::OpenAiProvider;

/// Text, image and audio generation behind one interface.
///
/// Implementations report transient failures as `Network` or `Provider`
/// errors so the orchestrator retries them.
#[async_trait]
pub trait AiProvider: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &'static str;

    /// Vector for `text`. May be empty if the provider produced nothing;
    /// callers must treat that as an error.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate an illustration and return its URL.
    async fn generate_image(&self, prompt: &str) -> Result<String>;

    /// Synthesize narration for `text` and return the encoded audio.
    async fn generate_audio(&self, text: &str) -> Result<Vec<u8>>;
}

/// Build the provider selected in config.
pub fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn AiProvider>> {
    match config.kind {
        ProviderKind::Hashing => Ok(Arc::new(HashingProvider::new(config.dimensions))),
        ProviderKind::Openai => {
            let api_key = std::env::var(&config.api_key_env).map_err(|_| {
                LorepathError::config(format!(
                    "provider API key not found. Set the {} environment variable.",
                    config.api_key_env
                ))
            })?;
            Ok(Arc::new(OpenAiProvider::new(config.clone(), api_key)?))
        }
    }
}

// ---------------------------------------------------------------------------
// Hashing provider
// ---------------------------------------------------------------------------

/// Deterministic bag-of-words embedder using signed feature hashing.
///
/// Texts sharing vocabulary get similar vectors. Vectors are L2-normalized;
/// text without any word characters yields an empty vector.
#[derive(Debug, Clone)]
pub struct HashingProvider {
    dimensions: usize,
}

impl HashingProvider {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    /// Synchronous core of [`AiProvider::embed`].
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let mut tokens = 0usize;

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let mut index_bytes = [0u8; 8];
            index_bytes.copy_from_slice(&digest[..8]);
            let index = (u64::from_le_bytes(index_bytes) % self.dimensions as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
            tokens += 1;
        }

        if tokens == 0 {
            return Vec::new();
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm == 0.0 {
            return Vec::new();
        }
        vector.iter_mut().for_each(|v| *v /= norm);
        vector
    }
}

#[async_trait]
impl AiProvider for HashingProvider {
    fn name(&self) -> &'static str {
        "hashing"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_text(text))
    }

    async fn generate_image(&self, _prompt: &str) -> Result<String> {
        Err(LorepathError::config(
            "the hashing provider does not generate images",
        ))
    }

    async fn generate_audio(&self, _text: &str) -> Result<Vec<u8>> {
        Err(LorepathError::config(
            "the hashing provider does not generate audio",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cosine_similarity;

    #[test]
    fn hashing_is_deterministic_and_normalized() {
        let provider = HashingProvider::new(64);
        let a = provider.embed_text("Vectors and Matrices");
        let b = provider.embed_text("vectors and matrices");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn shared_vocabulary_is_more_similar() {
        let provider = HashingProvider::new(256);
        let base = provider.embed_text("linear algebra vectors matrices");
        let near = provider.embed_text("linear algebra vectors");
        let far = provider.embed_text("medieval poetry sonnets");
        assert!(cosine_similarity(&base, &near) > cosine_similarity(&base, &far));
    }

    #[test]
    fn empty_text_has_no_vector() {
        let provider = HashingProvider::new(16);
        assert!(provider.embed_text("").is_empty());
        assert!(provider.embed_text("  ... !!").is_empty());
    }

    #[tokio::test]
    async fn hashing_provider_does_not_author_media() {
        let provider = HashingProvider::new(16);
        let err = provider.generate_image("a cell").await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn openai_requires_key_env() {
        let config = ProviderConfig {
            kind: ProviderKind::Openai,
            api_key_env: "LOREPATH_TEST_KEY_THAT_IS_NOT_SET".into(),
            ..ProviderConfig::default()
        };
        assert!(build_provider(&config).is_err());

        let hashing = build_provider(&ProviderConfig::default()).unwrap();
        assert_eq!(hashing.name(), "hashing");
    }
}
