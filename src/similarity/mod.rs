use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::models::SimilarityMethod;
use crate::TARGET_DEDUP;

pub mod embedding;
pub mod lexical;
pub mod overlap;

pub use embedding::{EmbeddingBackend, EmbeddingProvider, OllamaEmbeddingProvider};
pub use lexical::TfIdfBackend;
pub use overlap::TokenOverlapBackend;

/// One interchangeable similarity strategy. Backends are ordered strongest
/// first; a failing backend falls through to the next tier rather than
/// surfacing an error to the caller.
#[async_trait]
pub trait SimilarityBackend: Send + Sync {
    fn method(&self) -> SimilarityMethod;

    /// Scores textual similarity in [0, 1].
    async fn score(&self, a: &str, b: &str) -> Result<f64>;

    /// Batched form; backends with real batching override this.
    async fn score_batch(&self, pairs: &[(&str, &str)]) -> Result<Vec<f64>> {
        let mut scores = Vec::with_capacity(pairs.len());
        for (a, b) in pairs {
            scores.push(self.score(a, b).await?);
        }
        Ok(scores)
    }
}

/// A score together with the backend that produced it, so clustering
/// decisions stay auditable.
#[derive(Debug, Clone, Copy)]
pub struct SimilarityScore {
    pub value: f64,
    /// None when every tier failed and the pair defaulted to "not similar".
    pub method: Option<SimilarityMethod>,
}

/// Scores textual similarity using the strongest available backend,
/// degrading tier by tier. Exhausting all tiers yields 0.0 instead of
/// failing the batch.
pub struct SimilarityEngine {
    backends: Vec<Arc<dyn SimilarityBackend>>,
}

impl SimilarityEngine {
    pub fn new(backends: Vec<Arc<dyn SimilarityBackend>>) -> Self {
        SimilarityEngine { backends }
    }

    /// Lexical tiers only: TF-IDF cosine, then token-set overlap.
    pub fn with_defaults() -> Self {
        SimilarityEngine::new(vec![
            Arc::new(TfIdfBackend::new()),
            Arc::new(TokenOverlapBackend),
        ])
    }

    /// All three tiers, strongest first: dense embedding cosine, TF-IDF
    /// cosine, token-set overlap.
    pub fn with_embeddings(provider: Arc<dyn EmbeddingProvider>) -> Self {
        SimilarityEngine::new(vec![
            Arc::new(EmbeddingBackend::new(provider)),
            Arc::new(TfIdfBackend::new()),
            Arc::new(TokenOverlapBackend),
        ])
    }

    pub async fn score(&self, a: &str, b: &str) -> SimilarityScore {
        for backend in &self.backends {
            match backend.score(a, b).await {
                Ok(value) => {
                    return SimilarityScore {
                        value: value.clamp(0.0, 1.0),
                        method: Some(backend.method()),
                    };
                }
                Err(e) => {
                    warn!(
                        target: TARGET_DEDUP,
                        "Similarity backend {} failed, falling through: {}",
                        backend.method().as_str(),
                        e
                    );
                }
            }
        }

        debug!(target: TARGET_DEDUP, "All similarity backends exhausted; treating pair as not similar");
        SimilarityScore {
            value: 0.0,
            method: None,
        }
    }

    pub async fn score_batch(&self, pairs: &[(&str, &str)]) -> Vec<SimilarityScore> {
        for backend in &self.backends {
            match backend.score_batch(pairs).await {
                Ok(values) => {
                    let method = backend.method();
                    return values
                        .into_iter()
                        .map(|value| SimilarityScore {
                            value: value.clamp(0.0, 1.0),
                            method: Some(method),
                        })
                        .collect();
                }
                Err(e) => {
                    warn!(
                        target: TARGET_DEDUP,
                        "Similarity backend {} failed on batch, falling through: {}",
                        backend.method().as_str(),
                        e
                    );
                }
            }
        }

        pairs
            .iter()
            .map(|_| SimilarityScore {
                value: 0.0,
                method: None,
            })
            .collect()
    }
}

/// Cosine similarity between two equal-length vectors. Errors on dimension
/// mismatch or near-zero magnitude so the caller can fall through.
pub fn cosine_similarity(vec1: &[f32], vec2: &[f32]) -> Result<f64> {
    if vec1.len() != vec2.len() {
        return Err(anyhow::anyhow!(
            "Vector dimensions don't match: {} vs {}",
            vec1.len(),
            vec2.len()
        ));
    }

    let mag1: f32 = vec1.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag2: f32 = vec2.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag1 < 0.001 || mag2 < 0.001 {
        return Err(anyhow::anyhow!("Zero magnitude vector detected"));
    }

    let dot_product: f32 = vec1.iter().zip(vec2.iter()).map(|(a, b)| a * b).sum();
    Ok((dot_product / (mag1 * mag2)) as f64)
}
