use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use ollama_rs::generation::embeddings::request::{EmbeddingsInput, GenerateEmbeddingsRequest};
use ollama_rs::Ollama;
use std::sync::Arc;
use tracing::debug;

use super::{cosine_similarity, SimilarityBackend};
use crate::models::{CandidateItem, SimilarityMethod};
use crate::TARGET_LLM_REQUEST;

/// Produces dense embeddings for similarity scoring. Injectable so tests and
/// alternative model hosts don't need a live service.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Embedding provider backed by the Ollama embeddings endpoint.
pub struct OllamaEmbeddingProvider {
    ollama: Ollama,
    model: String,
}

impl OllamaEmbeddingProvider {
    pub fn new(host: &str, port: u16, model: &str) -> Self {
        OllamaEmbeddingProvider {
            ollama: Ollama::new(host.to_string(), port),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = GenerateEmbeddingsRequest::new(
            self.model.clone(),
            EmbeddingsInput::Single(text.to_string()),
        );
        let response = self.ollama.generate_embeddings(request).await?;
        let embedding = response
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Embedding service returned no vectors"))?;
        debug!(target: TARGET_LLM_REQUEST, "Generated embedding with {} dimensions", embedding.len());
        Ok(embedding)
    }
}

/// Strongest similarity tier: dense embedding cosine similarity. Embeddings
/// are cached per content digest, since clustering scores each text against
/// many partners in one batch.
pub struct EmbeddingBackend {
    provider: Arc<dyn EmbeddingProvider>,
    cache: DashMap<String, Vec<f32>>,
}

impl EmbeddingBackend {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        EmbeddingBackend {
            provider,
            cache: DashMap::new(),
        }
    }

    async fn embedding_for(&self, text: &str) -> Result<Vec<f32>> {
        let key = CandidateItem::compute_digest(text);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.clone());
        }
        let embedding = self.provider.embed(text).await?;
        self.cache.insert(key, embedding.clone());
        Ok(embedding)
    }
}

#[async_trait]
impl SimilarityBackend for EmbeddingBackend {
    fn method(&self) -> SimilarityMethod {
        SimilarityMethod::Embedding
    }

    async fn score(&self, a: &str, b: &str) -> Result<f64> {
        let vec_a = self.embedding_for(a).await?;
        let vec_b = self.embedding_for(b).await?;
        cosine_similarity(&vec_a, &vec_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Deterministic toy embedding: character-class counts.
            let letters = text.chars().filter(|c| c.is_alphabetic()).count() as f32;
            let spaces = text.chars().filter(|c| c.is_whitespace()).count() as f32;
            Ok(vec![letters + 1.0, spaces + 1.0])
        }
    }

    #[tokio::test]
    async fn caches_embeddings_per_text() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let backend = EmbeddingBackend::new(provider.clone());

        let first = backend.score("same text", "other words").await.unwrap();
        let second = backend.score("same text", "other words").await.unwrap();
        assert!((first - second).abs() < 1e-9);
        // Two distinct texts, each embedded once.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn identical_texts_score_one() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let backend = EmbeddingBackend::new(provider);
        let score = backend.score("storm warning", "storm warning").await.unwrap();
        assert!((score - 1.0).abs() < 1e-6);
    }
}
