use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use unicode_segmentation::UnicodeSegmentation;

use super::SimilarityBackend;
use crate::models::SimilarityMethod;

/// Weakest similarity tier: Jaccard overlap of normalized token sets.
/// Infallible by construction, so it terminates the fallback chain.
pub struct TokenOverlapBackend;

fn token_set(text: &str) -> HashSet<String> {
    text.unicode_words().map(|w| w.to_lowercase()).collect()
}

#[async_trait]
impl SimilarityBackend for TokenOverlapBackend {
    fn method(&self) -> SimilarityMethod {
        SimilarityMethod::TokenOverlap
    }

    async fn score(&self, a: &str, b: &str) -> Result<f64> {
        let set_a = token_set(a);
        let set_b = token_set(b);

        let union = set_a.union(&set_b).count();
        if union == 0 {
            return Ok(0.0);
        }
        let intersection = set_a.intersection(&set_b).count();
        Ok(intersection as f64 / union as f64)
    }
}
