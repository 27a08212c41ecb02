use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PipelineError;

/// A candidate news item as delivered by the upstream collector and triage
/// stages. Immutable once created; duplicate-exclusion is recorded on the
/// persisted row, never by mutating the in-memory value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateItem {
    pub id: String,
    pub title: String,
    /// Extracted body text, supplied by the upstream extraction stage.
    pub text: String,
    /// SHA-256 hex digest of the body text.
    pub content_digest: String,
    pub source: String,
    /// Ordinal trust ranking of the source; higher is more authoritative.
    pub authority_tier: u8,
    /// Extraction/content-quality score from the triage stage.
    pub quality: f64,
    /// Triage confidence in [0, 1].
    pub confidence: f64,
    pub discovered_at: DateTime<Utc>,
}

impl CandidateItem {
    pub fn content_length(&self) -> usize {
        self.text.len()
    }

    /// Computes the content digest used for exact-duplicate short-circuiting.
    pub fn compute_digest(text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Validates the fields the core depends on. A failure here is a
    /// `DataIntegrity` error: the item is skipped, never the batch.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.id.trim().is_empty() {
            return Err(PipelineError::DataIntegrity(
                "candidate has an empty id".to_string(),
            ));
        }
        if self.text.trim().is_empty() {
            return Err(PipelineError::DataIntegrity(format!(
                "candidate {} has no extracted text",
                self.id
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(PipelineError::DataIntegrity(format!(
                "candidate {} has confidence {} outside [0, 1]",
                self.id, self.confidence
            )));
        }
        Ok(())
    }
}

/// Which similarity backend produced the qualifying links for a cluster.
/// Recorded as data so cluster decisions stay auditable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimilarityMethod {
    /// Identical content digests; no similarity call was needed.
    DigestMatch,
    Embedding,
    TfIdf,
    TokenOverlap,
}

impl SimilarityMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SimilarityMethod::DigestMatch => "digest_match",
            SimilarityMethod::Embedding => "embedding",
            SimilarityMethod::TfIdf => "tfidf",
            SimilarityMethod::TokenOverlap => "token_overlap",
        }
    }

    /// Strength ordering: lower is stronger. Used when a cluster was built
    /// from links scored by different backends.
    pub fn tier(&self) -> u8 {
        match self {
            SimilarityMethod::DigestMatch => 0,
            SimilarityMethod::Embedding => 1,
            SimilarityMethod::TfIdf => 2,
            SimilarityMethod::TokenOverlap => 3,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "digest_match" => Some(SimilarityMethod::DigestMatch),
            "embedding" => Some(SimilarityMethod::Embedding),
            "tfidf" => Some(SimilarityMethod::TfIdf),
            "token_overlap" => Some(SimilarityMethod::TokenOverlap),
            _ => None,
        }
    }
}

/// A same-batch duplicate cluster. Holds item ids only; the batch map from
/// id to item is the single source of truth, so no back-pointers exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateCluster {
    pub id: String,
    /// Sorted, set semantics: every member belongs to at most one cluster
    /// per clustering pass.
    pub member_ids: Vec<String>,
    pub primary_id: String,
    pub method: SimilarityMethod,
    pub created_at: DateTime<Utc>,
}

/// A compact persisted fingerprint of a story already surfaced today, used
/// to detect repeat coverage across same-day runs. Only ever compared within
/// its own day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicSignature {
    pub id: i64,
    pub day: NaiveDate,
    /// Monotonic per day: which same-day run stored this signature.
    pub run_sequence: i64,
    pub theme: String,
    pub excerpt: String,
    pub source_item_id: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a cross-run comparison for one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Duplicate,
    Unique,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Duplicate => "DUPLICATE",
            Decision::Unique => "UNIQUE",
        }
    }
}

/// Append-only audit row: one per candidate per dedup pass. Never mutated,
/// deleted only by retention cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeduplicationDecision {
    pub item_id: String,
    pub day: NaiveDate,
    pub decision: Decision,
    pub matched_signature_id: Option<i64>,
    pub confidence: f64,
    /// Set when the comparison failed and the candidate was passed through
    /// fail-open rather than genuinely judged.
    pub error_flag: bool,
    pub processing_ms: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "paused" => Some(RunStatus::Paused),
            _ => None,
        }
    }
}

/// The declared steps of a pipeline run, in fixed execution order. Most are
/// external collaborators; `Dedup` is the step this crate owns end to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepName {
    Collection,
    Filtering,
    Scraping,
    Summarization,
    Dedup,
    Analysis,
}

impl StepName {
    pub const ALL: [StepName; 6] = [
        StepName::Collection,
        StepName::Filtering,
        StepName::Scraping,
        StepName::Summarization,
        StepName::Dedup,
        StepName::Analysis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::Collection => "collection",
            StepName::Filtering => "filtering",
            StepName::Scraping => "scraping",
            StepName::Summarization => "summarization",
            StepName::Dedup => "dedup",
            StepName::Analysis => "analysis",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "collection" => Some(StepName::Collection),
            "filtering" => Some(StepName::Filtering),
            "scraping" => Some(StepName::Scraping),
            "summarization" => Some(StepName::Summarization),
            "dedup" => Some(StepName::Dedup),
            "analysis" => Some(StepName::Analysis),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: String,
    pub mode: String,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub run_id: String,
    pub step: StepName,
    pub status: RunStatus,
    pub processed: i64,
    pub succeeded: i64,
    pub failed: i64,
    /// Most recent error for this step, retained verbatim.
    pub error: Option<String>,
    /// Item ids already committed before an interruption; resume skips these.
    pub checkpoint: Vec<String>,
    /// Cleared when the step fails; a failed step is never re-entered and
    /// recovery requires a new run.
    pub can_resume: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn candidate(id: &str, text: &str) -> CandidateItem {
        CandidateItem {
            id: id.to_string(),
            title: "title".to_string(),
            text: text.to_string(),
            content_digest: CandidateItem::compute_digest(text),
            source: "example.com".to_string(),
            authority_tier: 1,
            quality: 0.5,
            confidence: 0.9,
            discovered_at: Utc::now(),
        }
    }

    #[test]
    fn digest_is_stable_and_content_sensitive() {
        let a = CandidateItem::compute_digest("same text");
        let b = CandidateItem::compute_digest("same text");
        let c = CandidateItem::compute_digest("different text");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn validate_rejects_missing_fields() {
        assert!(candidate("a", "body").validate().is_ok());
        assert!(candidate("", "body").validate().is_err());
        assert!(candidate("a", "   ").validate().is_err());

        let mut bad_confidence = candidate("a", "body");
        bad_confidence.confidence = 1.5;
        assert!(bad_confidence.validate().is_err());
    }

    #[test]
    fn method_round_trips_through_strings() {
        for method in [
            SimilarityMethod::DigestMatch,
            SimilarityMethod::Embedding,
            SimilarityMethod::TfIdf,
            SimilarityMethod::TokenOverlap,
        ] {
            assert_eq!(SimilarityMethod::parse(method.as_str()), Some(method));
        }
        assert!(SimilarityMethod::parse("levenshtein").is_none());
    }
}
