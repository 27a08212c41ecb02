use anyhow::Result;
use async_trait::async_trait;
use rust_stemmers::{Algorithm, Stemmer};
use std::collections::HashMap;
use unicode_segmentation::UnicodeSegmentation;

use super::SimilarityBackend;
use crate::models::SimilarityMethod;

/// Middle similarity tier: TF-IDF cosine similarity over stemmed tokens.
/// Operates on the pair as a two-document corpus with smoothed IDF, so terms
/// shared by both documents still carry weight.
pub struct TfIdfBackend {
    stemmer: Stemmer,
}

impl TfIdfBackend {
    pub fn new() -> Self {
        TfIdfBackend {
            stemmer: Stemmer::create(Algorithm::English),
        }
    }

    fn term_frequencies(&self, text: &str) -> HashMap<String, f64> {
        let mut counts: HashMap<String, f64> = HashMap::new();
        let mut total = 0.0;
        for word in text.unicode_words() {
            let stemmed = self.stemmer.stem(&word.to_lowercase()).to_string();
            *counts.entry(stemmed).or_insert(0.0) += 1.0;
            total += 1.0;
        }
        if total > 0.0 {
            for value in counts.values_mut() {
                *value /= total;
            }
        }
        counts
    }
}

impl Default for TfIdfBackend {
    fn default() -> Self {
        TfIdfBackend::new()
    }
}

#[async_trait]
impl SimilarityBackend for TfIdfBackend {
    fn method(&self) -> SimilarityMethod {
        SimilarityMethod::TfIdf
    }

    async fn score(&self, a: &str, b: &str) -> Result<f64> {
        let tf_a = self.term_frequencies(a);
        let tf_b = self.term_frequencies(b);

        if tf_a.is_empty() || tf_b.is_empty() {
            return Err(anyhow::anyhow!("No tokens to score"));
        }

        // Smoothed IDF over the two-document corpus: idf = ln((1+N)/(1+df)) + 1.
        let idf = |term: &str| -> f64 {
            let df = tf_a.contains_key(term) as usize + tf_b.contains_key(term) as usize;
            ((1.0 + 2.0) / (1.0 + df as f64)).ln() + 1.0
        };

        let mut dot = 0.0;
        let mut norm_a = 0.0;
        let mut norm_b = 0.0;

        for (term, tf) in &tf_a {
            let weight = tf * idf(term);
            norm_a += weight * weight;
            if let Some(tf_other) = tf_b.get(term) {
                dot += weight * (tf_other * idf(term));
            }
        }
        for (term, tf) in &tf_b {
            let weight = tf * idf(term);
            norm_b += weight * weight;
        }

        if norm_a == 0.0 || norm_b == 0.0 {
            return Err(anyhow::anyhow!("Zero-weight document"));
        }

        Ok(dot / (norm_a.sqrt() * norm_b.sqrt()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identical_documents_score_one() {
        let backend = TfIdfBackend::new();
        let text = "The senate passed the spending bill late on Thursday";
        let score = backend.score(text, text).await.unwrap();
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn disjoint_documents_score_zero() {
        let backend = TfIdfBackend::new();
        let score = backend
            .score("volcanic eruption iceland", "quarterly earnings report")
            .await
            .unwrap();
        assert_eq!(score, 0.0);
    }

    #[tokio::test]
    async fn rewordings_score_between_zero_and_one() {
        let backend = TfIdfBackend::new();
        let score = backend
            .score(
                "Wildfire forces evacuation of coastal towns",
                "Coastal towns evacuated as wildfire spreads",
            )
            .await
            .unwrap();
        assert!(score > 0.3, "score was {}", score);
        assert!(score < 1.0);
    }

    #[tokio::test]
    async fn stemming_matches_inflected_forms() {
        let backend = TfIdfBackend::new();
        let score = backend
            .score("evacuations continuing", "evacuation continues")
            .await
            .unwrap();
        assert!(score > 0.9, "score was {}", score);
    }

    #[tokio::test]
    async fn empty_text_errors_to_allow_fallthrough() {
        let backend = TfIdfBackend::new();
        assert!(backend.score("", "some words").await.is_err());
    }
}
