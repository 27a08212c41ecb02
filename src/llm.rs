use ollama_rs::generation::completion::request::GenerationRequest;
use ollama_rs::generation::options::GenerationOptions;
use ollama_rs::Ollama;
use rand::Rng;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::TARGET_LLM_REQUEST;

/// Connection and retry parameters for the comparison service.
#[derive(Clone)]
pub struct LlmParams {
    pub ollama: Ollama,
    pub model: String,
    pub temperature: f32,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl LlmParams {
    pub fn new(host: &str, port: u16, model: &str) -> Self {
        LlmParams {
            ollama: Ollama::new(host.to_string(), port),
            model: model.to_string(),
            temperature: 0.0,
            timeout_secs: 120,
            max_retries: 3,
        }
    }
}

/// Sends a prompt to the comparison service with a timeout and a bounded
/// retry budget, backing off exponentially between attempts. Exhausting the
/// budget yields a `Transient` error; the caller decides how to fail open.
pub async fn generate_llm_response(
    prompt: &str,
    params: &LlmParams,
) -> Result<String, PipelineError> {
    let mut backoff = 2u64;
    let mut last_error = String::new();

    debug!(target: TARGET_LLM_REQUEST, "Starting LLM request against model {}", params.model);

    for retry_count in 0..params.max_retries {
        let mut request = GenerationRequest::new(params.model.clone(), prompt.to_string());
        request.options = Some(GenerationOptions::default().temperature(params.temperature));

        match timeout(
            Duration::from_secs(params.timeout_secs),
            params.ollama.generate(request),
        )
        .await
        {
            Ok(Ok(response)) => {
                debug!(target: TARGET_LLM_REQUEST, "LLM response received ({} bytes)", response.response.len());
                return Ok(response.response);
            }
            Ok(Err(e)) => {
                last_error = e.to_string();
                warn!(target: TARGET_LLM_REQUEST, "Error generating response: {}", e);
            }
            Err(_) => {
                last_error = format!("request timed out after {}s", params.timeout_secs);
                warn!(target: TARGET_LLM_REQUEST, "LLM request timed out");
            }
        }

        if retry_count < params.max_retries - 1 {
            // Jitter avoids retry storms when several comparisons fail at once.
            let jitter = rand::rng().random_range(0..500);
            let delay = Duration::from_secs(backoff) + Duration::from_millis(jitter);
            info!(
                target: TARGET_LLM_REQUEST,
                "Retrying LLM request in {:?}... ({}/{})",
                delay,
                retry_count + 1,
                params.max_retries
            );
            sleep(delay).await;
            backoff *= 2;
        }
    }

    error!(
        target: TARGET_LLM_REQUEST,
        "Failed to generate response after {} retries: {}",
        params.max_retries, last_error
    );
    Err(PipelineError::Transient(last_error))
}
