//! Embedding service: per-unit vectors and organization-scoped search.
//!
//! Vectors come from an [`AiProvider`]. An empty vector is always an
//! [`LorepathError::EmptyEmbedding`]; it is never stored, since a blank
//! vector would corrupt similarity search.

mod openai;
mod provider;

use std::sync::Arc;

use tracing::{debug, instrument};

use lorepath_shared::{LorepathError, Result, SearchConfig};
use lorepath_storage::Storage;

pub use openai::OpenAiProvider;
pub use provider::{AiProvider, HashingProvider, build_provider};

/// A search result.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub nugget_id: String,
    pub similarity: f32,
}

/// Computes and queries content-unit embeddings.
#[derive(Clone)]
pub struct EmbeddingService {
    provider: Arc<dyn AiProvider>,
    storage: Arc<Storage>,
    config: SearchConfig,
}

impl EmbeddingService {
    pub fn new(provider: Arc<dyn AiProvider>, storage: Arc<Storage>, config: SearchConfig) -> Self {
        Self {
            provider,
            storage,
            config,
        }
    }

    /// Vector for `text`, rejecting empty input and empty provider output.
    #[instrument(skip_all, fields(provider = self.provider.name(), subject = %subject))]
    pub async fn embed(&self, subject: &str, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(LorepathError::EmptyEmbedding(format!("{subject}: no text")));
        }
        let vector = self.provider.embed(text).await?;
        if vector.is_empty() {
            return Err(LorepathError::EmptyEmbedding(format!(
                "{subject}: provider returned no vector"
            )));
        }
        debug!(dimensions = vector.len(), "embedding computed");
        Ok(vector)
    }

    /// Embed a content unit's text and store the vector, marking it `ready`.
    pub async fn embed_nugget(&self, nugget_id: &str, content: &str) -> Result<Vec<f32>> {
        let vector = self.embed(nugget_id, content).await?;
        self.storage.set_nugget_embedding(nugget_id, &vector).await?;
        Ok(vector)
    }

    /// Search with the configured threshold and limit.
    pub async fn search(&self, query: &[f32], organization_id: &str) -> Result<Vec<SearchHit>> {
        self.search_with(query, organization_id, self.config.threshold, self.config.limit)
            .await
    }

    /// `ready` units of `organization_id` with cosine similarity strictly
    /// above `threshold`, most similar first, at most `limit` of them.
    #[instrument(skip_all, fields(org_id = %organization_id, threshold = threshold, limit = limit))]
    pub async fn search_with(
        &self,
        query: &[f32],
        organization_id: &str,
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let candidates = self.storage.ready_embeddings(organization_id).await?;

        let mut hits: Vec<SearchHit> = candidates
            .into_iter()
            .filter_map(|(nugget_id, embedding)| {
                if embedding.len() != query.len() {
                    return None;
                }
                let similarity = cosine_similarity(query, &embedding);
                (similarity > threshold).then_some(SearchHit {
                    nugget_id,
                    similarity,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.nugget_id.cmp(&b.nugget_id))
        });
        hits.truncate(limit);
        debug!(hits = hits.len(), "similarity search complete");
        Ok(hits)
    }

    /// Embed free text and search with the configured defaults.
    pub async fn search_text(&self, text: &str, organization_id: &str) -> Result<Vec<SearchHit>> {
        let query = self.embed("query", text).await?;
        self.search(&query, organization_id).await
    }
}

/// Cosine similarity of two equal-length vectors; 0.0 if either is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lorepath_shared::{Nugget, NuggetStatus};
    use uuid::Uuid;

    struct EmptyProvider;

    #[async_trait]
    impl AiProvider for EmptyProvider {
        fn name(&self) -> &'static str {
            "empty"
        }
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(Vec::new())
        }
        async fn generate_image(&self, _prompt: &str) -> Result<String> {
            Ok(String::new())
        }
        async fn generate_audio(&self, _text: &str) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    async fn test_storage() -> Arc<Storage> {
        let tmp = std::env::temp_dir().join(format!("lp_embed_test_{}.db", Uuid::now_v7()));
        Arc::new(Storage::open(&tmp).await.expect("open test db"))
    }

    async fn ready(storage: &Storage, org: &str, source: &str, vector: &[f32]) -> String {
        let n = Nugget::new(org, "t", source, source, None);
        storage.insert_nugget_if_absent(&n).await.unwrap();
        storage.set_nugget_embedding(&n.id, vector).await.unwrap();
        n.id
    }

    fn service(storage: Arc<Storage>) -> EmbeddingService {
        EmbeddingService::new(
            Arc::new(HashingProvider::new(8)),
            storage,
            SearchConfig::default(),
        )
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-2.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn empty_vectors_fail_loudly() {
        let storage = test_storage().await;
        let n = Nugget::new("org", "t", "/a", "real text", None);
        storage.insert_nugget_if_absent(&n).await.unwrap();

        let svc = EmbeddingService::new(
            Arc::new(EmptyProvider),
            storage.clone(),
            SearchConfig::default(),
        );
        let err = svc.embed_nugget(&n.id, "real text").await.unwrap_err();
        assert!(matches!(err, LorepathError::EmptyEmbedding(_)));
        assert!(!err.is_retryable());

        // Nothing was stored
        let loaded = storage.get_nugget(&n.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, NuggetStatus::Pending);
        assert!(loaded.embedding.is_none());

        let err = service(storage).embed("q", "   ").await.unwrap_err();
        assert!(matches!(err, LorepathError::EmptyEmbedding(_)));
    }

    #[tokio::test]
    async fn search_filters_threshold_org_and_status() {
        let storage = test_storage().await;
        let close = ready(&storage, "org", "/close", &[1.0, 0.1]).await;
        let closer = ready(&storage, "org", "/closer", &[1.0, 0.0]).await;
        let far = ready(&storage, "org", "/far", &[0.0, 1.0]).await;
        ready(&storage, "other", "/foreign", &[1.0, 0.0]).await;

        // Pending unit without a vector never appears
        let pending = Nugget::new("org", "t", "/pending", "x", None);
        storage.insert_nugget_if_absent(&pending).await.unwrap();

        let svc = service(storage);
        let hits = svc.search(&[1.0, 0.0], "org").await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.nugget_id.as_str()).collect();
        assert_eq!(ids, vec![closer.as_str(), close.as_str()]);
        assert!(hits.iter().all(|h| h.similarity > 0.7));
        assert!(hits[0].similarity >= hits[1].similarity);

        let lower = svc.search_with(&[1.0, 0.0], "org", 0.0, 20).await.unwrap();
        assert!(hits.iter().all(|h| lower.contains(h)));

        let everything = svc.search_with(&[1.0, 0.0], "org", -1.0, 20).await.unwrap();
        assert_eq!(everything.len(), 3);
        assert_eq!(everything[2].nugget_id, far);

        let capped = svc.search_with(&[1.0, 0.0], "org", -1.0, 1).await.unwrap();
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].nugget_id, closer);
    }

    #[tokio::test]
    async fn threshold_is_strict() {
        let storage = test_storage().await;
        ready(&storage, "org", "/same", &[1.0, 0.0]).await;
        let svc = service(storage);
        assert!(svc.search_with(&[1.0, 0.0], "org", 1.0, 20).await.unwrap().is_empty());
    }
}
