use thiserror::Error;

/// Failure taxonomy for the pipeline.
///
/// The variants map directly onto propagation policy:
/// - `Transient`: external comparison-service timeouts/errors. Retried with
///   backoff, then handled fail-open at the item or step level.
/// - `Persistence`: the state store is unreachable or rejects writes. Fatal
///   for the enclosing run.
/// - `DataIntegrity`: a malformed candidate (missing required field, empty
///   text). The item is skipped with a logged reason; the batch continues.
/// - `Configuration`: invalid threshold/mode/knob. Fails fast before a run
///   mutates any state.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("transient external error: {0}")]
    Transient(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("data integrity error: {0}")]
    DataIntegrity(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl PipelineError {
    /// True when the error must abort the whole run rather than degrade.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::Persistence(_))
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::DataIntegrity(format!("malformed JSON: {}", err))
    }
}
