// THEORY:
// The `EmbeddingClient` turns crops into vectors with a single batched call to
// an external multimodal embedding service. One request per invocation, not
// one per region: latency is dominated by the round-trip, not by the payload.
//
// The contract that matters is positional. Vector `i` must belong to crop `i`.
// The service is trusted to keep order (re-ordering by an explicit `index`
// when it sends one), and `embed_regions` enforces the count so a short or
// padded answer can never be silently zipped against the wrong labels.
//
// This component never retries. Retrying is the orchestrator's policy.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::core_modules::region_cropper::CropRegion;
use crate::error::{PipelineError, UpstreamFailure};

pub type EmbeddingVector = Vec<f32>;

/// Which side of the retrieval problem an embedding is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingMode {
    /// Query images coming from shoppers.
    Query,
    /// Catalog images being indexed.
    Passage,
}

impl EmbeddingMode {
    pub fn task(self) -> &'static str {
        match self {
            EmbeddingMode::Query => "retrieval.query",
            EmbeddingMode::Passage => "retrieval.passage",
        }
    }
}

/// An external service that embeds a batch of images, one vector per image.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed_images(
        &self,
        image_data_uris: &[String],
        mode: EmbeddingMode,
    ) -> Result<Vec<EmbeddingVector>, PipelineError>;
}

/// Embeds every crop in one batch, in crop order.
pub async fn embed_regions(
    provider: &dyn EmbeddingProvider,
    regions: &[CropRegion],
    dimensions: usize,
) -> Result<Vec<EmbeddingVector>, PipelineError> {
    let images: Vec<String> = regions.iter().map(CropRegion::to_data_uri).collect();
    let vectors = provider.embed_images(&images, EmbeddingMode::Query).await?;

    if vectors.len() != regions.len() {
        return Err(PipelineError::EmbeddingCountMismatch {
            expected: regions.len(),
            actual: vectors.len(),
        });
    }
    if let Some((index, vector)) = vectors
        .iter()
        .enumerate()
        .find(|(_, vector)| vector.len() != dimensions)
    {
        return Err(PipelineError::EmbeddingService(UpstreamFailure::new(
            Some(200),
            format!(
                "vector {index} has {} dimensions, expected {dimensions}",
                vector.len()
            ),
        )));
    }
    Ok(vectors)
}

/// Settings for [`HttpEmbeddingClient`].
#[derive(Debug, Clone)]
pub struct EmbeddingSettings {
    /// Full embeddings endpoint, e.g. `https://api.jina.ai/v1/embeddings`.
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    /// Requested output dimensionality, forwarded when the model supports it.
    pub dimensions: Option<usize>,
    pub timeout: Duration,
}

/// Async client for Jina-style multimodal embedding endpoints.
#[derive(Clone)]
pub struct HttpEmbeddingClient {
    client: Client,
    endpoint: String,
    model: String,
    dimensions: Option<usize>,
}

impl HttpEmbeddingClient {
    pub fn new(settings: EmbeddingSettings) -> Result<Self, PipelineError> {
        let config_error = |message: String| {
            PipelineError::EmbeddingService(UpstreamFailure::unreachable(message))
        };
        if !(settings.endpoint.starts_with("http://") || settings.endpoint.starts_with("https://")) {
            return Err(config_error("embedding endpoint must be an http(s) URL".into()));
        }
        if settings.model.trim().is_empty() {
            return Err(config_error("missing embedding model name".into()));
        }

        let mut headers = HeaderMap::new();
        if !settings.api_key.trim().is_empty() {
            let auth = format!("Bearer {}", settings.api_key.trim());
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth)
                    .map_err(|_| config_error("invalid embedding API key".into()))?,
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(settings.timeout)
            .default_headers(headers)
            .build()
            .map_err(|err| config_error(format!("failed to build embedding HTTP client: {err}")))?;

        Ok(Self {
            client,
            endpoint: settings.endpoint,
            model: settings.model,
            dimensions: settings.dimensions,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingClient {
    async fn embed_images(
        &self,
        image_data_uris: &[String],
        mode: EmbeddingMode,
    ) -> Result<Vec<EmbeddingVector>, PipelineError> {
        if image_data_uris.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbeddingRequest {
            model: &self.model,
            task: mode.task(),
            dimensions: self.dimensions,
            input: image_data_uris
                .iter()
                .map(|image| ImageInput { image })
                .collect(),
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|err| PipelineError::EmbeddingService(UpstreamFailure::unreachable(err.to_string())))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<body unavailable>".to_string());
        if !status.is_success() {
            return Err(PipelineError::EmbeddingService(UpstreamFailure::new(
                Some(status.as_u16()),
                body,
            )));
        }

        let parsed: EmbeddingResponse = serde_json::from_str(&body).map_err(|err| {
            PipelineError::EmbeddingService(UpstreamFailure::new(
                Some(status.as_u16()),
                format!("unreadable embedding response ({err}): {body}"),
            ))
        })?;
        let Some(mut data) = parsed.data else {
            return Err(PipelineError::EmbeddingService(UpstreamFailure::new(
                Some(status.as_u16()),
                format!("response is missing the data array: {body}"),
            )));
        };

        if data.iter().all(|entry| entry.index.is_some()) {
            data.sort_by_key(|entry| entry.index);
            let contiguous = data
                .iter()
                .enumerate()
                .all(|(position, entry)| entry.index == Some(position));
            if !contiguous {
                let indices: Vec<Option<usize>> = data.iter().map(|entry| entry.index).collect();
                return Err(PipelineError::EmbeddingService(UpstreamFailure::new(
                    Some(status.as_u16()),
                    format!("embedding indices are not 0..{}: {indices:?}", data.len()),
                )));
            }
        }
        Ok(data.into_iter().map(|entry| entry.embedding).collect())
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    task: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
    input: Vec<ImageInput<'a>>,
}

#[derive(Serialize)]
struct ImageInput<'a> {
    image: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Option<Vec<EmbeddingData>>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}
