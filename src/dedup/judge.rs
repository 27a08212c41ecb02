use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::PipelineError;
use crate::llm::{generate_llm_response, LlmParams};
use crate::models::{CandidateItem, TopicSignature};
use crate::prompts;
use crate::TARGET_LLM_REQUEST;

/// Verdict from a single same-topic comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum TopicJudgment {
    Unique,
    Duplicate { signature_id: i64, confidence: f64 },
}

/// Compares one candidate against a window of prior topic signatures.
/// Implementations may call out to a language model; errors are surfaced
/// so the deduplicator can fail open per item.
#[async_trait]
pub trait TopicJudge: Send + Sync {
    async fn compare(
        &self,
        candidate: &CandidateItem,
        window: &[TopicSignature],
    ) -> Result<TopicJudgment, PipelineError>;

    /// Short theme label for an item judged unique. The default derives it
    /// from the title so judges without generation support still work.
    async fn theme(&self, candidate: &CandidateItem) -> Result<String, PipelineError> {
        Ok(title_theme(candidate))
    }
}

pub fn title_theme(candidate: &CandidateItem) -> String {
    candidate
        .title
        .split_whitespace()
        .take(8)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Production judge backed by the comparison service.
pub struct LlmTopicJudge {
    params: LlmParams,
}

impl LlmTopicJudge {
    pub fn new(params: LlmParams) -> Self {
        LlmTopicJudge { params }
    }
}

#[async_trait]
impl TopicJudge for LlmTopicJudge {
    async fn compare(
        &self,
        candidate: &CandidateItem,
        window: &[TopicSignature],
    ) -> Result<TopicJudgment, PipelineError> {
        let prompt = prompts::same_topic_prompt(candidate, window);
        let response = generate_llm_response(&prompt, &self.params).await?;
        let judgment = parse_judgment(&response, window)?;
        debug!(
            target: TARGET_LLM_REQUEST,
            "Judged {} against {} signatures: {:?}",
            candidate.id,
            window.len(),
            judgment
        );
        Ok(judgment)
    }

    async fn theme(&self, candidate: &CandidateItem) -> Result<String, PipelineError> {
        let prompt = prompts::theme_prompt(candidate);
        let response = generate_llm_response(&prompt, &self.params).await?;
        let label = response.trim().trim_matches('"').trim();
        if label.is_empty() {
            Ok(title_theme(candidate))
        } else {
            Ok(label.to_string())
        }
    }
}

#[derive(Deserialize)]
struct JudgmentResponse {
    matched_story: Option<i64>,
    confidence: f64,
}

/// Strict parse boundary for judge responses. Anything malformed, and any
/// matched id that does not name a signature in the window, is an error the
/// caller turns into a fail-open unique decision.
pub fn parse_judgment(
    response: &str,
    window: &[TopicSignature],
) -> Result<TopicJudgment, PipelineError> {
    let body = extract_json(response).ok_or_else(|| {
        PipelineError::DataIntegrity(format!("no JSON object in judge response: {}", response))
    })?;
    let parsed: JudgmentResponse = serde_json::from_str(body)?;

    if !(0.0..=1.0).contains(&parsed.confidence) {
        return Err(PipelineError::DataIntegrity(format!(
            "judge confidence {} out of range",
            parsed.confidence
        )));
    }

    match parsed.matched_story {
        None => Ok(TopicJudgment::Unique),
        Some(id) => {
            if window.iter().any(|s| s.id == id) {
                Ok(TopicJudgment::Duplicate {
                    signature_id: id,
                    confidence: parsed.confidence,
                })
            } else {
                Err(PipelineError::DataIntegrity(format!(
                    "judge matched unknown story {}",
                    id
                )))
            }
        }
    }
}

fn extract_json(response: &str) -> Option<&str> {
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    if end > start {
        Some(&response[start..=end])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn window() -> Vec<TopicSignature> {
        (1..=3)
            .map(|i| TopicSignature {
                id: i,
                day: Utc::now().date_naive(),
                run_sequence: 1,
                theme: format!("theme-{}", i),
                excerpt: format!("excerpt-{}", i),
                source_item_id: format!("s{}", i),
                created_at: Utc::now(),
            })
            .collect()
    }

    #[test]
    fn parses_a_match_inside_the_window() {
        let judgment =
            parse_judgment(r#"{"matched_story": 2, "confidence": 0.91}"#, &window()).unwrap();
        assert_eq!(
            judgment,
            TopicJudgment::Duplicate {
                signature_id: 2,
                confidence: 0.91
            }
        );
    }

    #[test]
    fn null_match_is_unique() {
        let judgment =
            parse_judgment(r#"{"matched_story": null, "confidence": 0.2}"#, &window()).unwrap();
        assert_eq!(judgment, TopicJudgment::Unique);
    }

    #[test]
    fn unknown_story_id_is_rejected() {
        let result = parse_judgment(r#"{"matched_story": 99, "confidence": 0.9}"#, &window());
        assert!(matches!(result, Err(PipelineError::DataIntegrity(_))));
    }

    #[test]
    fn garbage_is_rejected_not_defaulted() {
        assert!(parse_judgment("the model rambles with no json", &window()).is_err());
        assert!(parse_judgment(r#"{"matched_story": "two"}"#, &window()).is_err());
    }

    #[test]
    fn out_of_range_confidence_is_rejected() {
        let result = parse_judgment(r#"{"matched_story": 1, "confidence": 1.7}"#, &window());
        assert!(matches!(result, Err(PipelineError::DataIntegrity(_))));
    }

    #[test]
    fn json_is_extracted_from_fenced_prose() {
        let response = "Sure! Here is the answer:\n```json\n{\"matched_story\": 1, \"confidence\": 0.8}\n```";
        let judgment = parse_judgment(response, &window()).unwrap();
        assert_eq!(
            judgment,
            TopicJudgment::Duplicate {
                signature_id: 1,
                confidence: 0.8
            }
        );
    }

    #[test]
    fn title_theme_caps_at_eight_words() {
        let candidate = CandidateItem {
            id: "c".to_string(),
            title: "one two three four five six seven eight nine ten".to_string(),
            text: "body".to_string(),
            content_digest: "d".to_string(),
            source: "s".to_string(),
            authority_tier: 1,
            quality: 0.5,
            confidence: 0.9,
            discovered_at: Utc::now(),
        };
        assert_eq!(title_theme(&candidate), "one two three four five six seven eight");
    }
}
