//! ============================================================================
//! Embedding Provider - Vector embeddings for memory retrieval
//! ============================================================================
//! `EmbeddingProvider` is the seam between the retrieval pipeline and an
//! external embedding service. `OpenAiEmbeddings` talks to any
//! OpenAI-compatible `/embeddings` endpoint.
//! ============================================================================

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::types::{CoreError, CoreResult};

/// Turns text into fixed-length vectors
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier stored alongside every vector this provider produces
    fn model(&self) -> &str;

    /// Embed several texts in one call. Output order matches input order.
    async fn embed_batch(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>>;

    /// Embed a single text
    async fn embed(&self, text: &str) -> CoreResult<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::Provider("No embedding returned".into()))
    }
}

/// Client for OpenAI-compatible embedding APIs
pub struct OpenAiEmbeddings {
    client: Client,
    api_key: String,
    url: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    model: Option<String>,
    usage: Option<EmbeddingUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct EmbeddingUsage {
    prompt_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

impl OpenAiEmbeddings {
    /// Create a client; every request is bounded by `timeout`
    pub fn new(api_key: String, url: String, model: String, timeout: Duration) -> CoreResult<Self> {
        if api_key.trim().is_empty() {
            return Err(CoreError::InvalidInput("Embedding API key is empty".into()));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::Provider(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            url,
            model,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    fn model(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        debug!("Generating embeddings for {} texts", texts.len());

        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| CoreError::Provider(format!("Failed to send embedding request: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CoreError::Provider(format!("Failed to read response body: {}", e)))?;

        decode_response(status, &body, texts.len())
    }
}

/// Parse an embeddings API response into vectors ordered by input index
fn decode_response(status: StatusCode, body: &str, expected: usize) -> CoreResult<Vec<Vec<f32>>> {
    if !status.is_success() {
        // Try to parse error response
        if let Ok(error) = serde_json::from_str::<ErrorResponse>(body) {
            return Err(CoreError::Provider(format!(
                "Embedding API error ({}): {}",
                status, error.error.message
            )));
        }
        return Err(CoreError::Provider(format!(
            "Embedding API error ({}): {}",
            status, body
        )));
    }

    let response: EmbeddingResponse = serde_json::from_str(body).map_err(|e| {
        CoreError::Provider(format!("Unexpected embedding response format: {}", e))
    })?;

    if let Some(usage) = &response.usage {
        debug!(
            "Embedding tokens used: {} (model: {})",
            usage.total_tokens,
            response.model.as_deref().unwrap_or("unknown")
        );
    }

    if response.data.len() != expected {
        return Err(CoreError::Provider(format!(
            "Embedding API returned {} vectors for {} inputs",
            response.data.len(),
            expected
        )));
    }

    let mut embeddings: Vec<(usize, Vec<f32>)> = response
        .data
        .into_iter()
        .map(|d| (d.index, d.embedding))
        .collect();
    embeddings.sort_by_key(|(idx, _)| *idx);

    let dimensions = embeddings.first().map(|(_, e)| e.len()).unwrap_or(0);
    if dimensions == 0 || embeddings.iter().any(|(_, e)| e.len() != dimensions) {
        return Err(CoreError::Provider(
            "Embedding API returned empty or inconsistent vectors".into(),
        ));
    }

    Ok(embeddings.into_iter().map(|(_, e)| e).collect())
}
