// THEORY:
// The `SimilaritySearch` aggregator is the last fan-out in the pipeline. Every
// region's embedding becomes an independent query against the catalog's vector
// index, and all queries run at once: nothing about region 2 depends on region 1,
// and the wall-clock cost is one round-trip rather than K of them.
//
// Key architectural principles:
// 1.  **Structured fan-out/fan-in**: queries are futures joined with `join_all`,
//     which yields results in input order regardless of completion order.
// 2.  **Per-region isolation**: a query that fails or times out degrades only its
//     own region to an empty match list. The failure is logged, never propagated.
// 3.  **Trust but verify**: the similarity threshold and result cap are sent to
//     the operator and re-applied locally, so a lax operator cannot leak
//     low-similarity rows or oversized lists into the response.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::core_modules::embedding_client::EmbeddingVector;
use crate::error::{SearchError, UpstreamFailure};

/// Catalog identifiers arrive as integers or strings depending on the schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProductId {
    Number(i64),
    Text(String),
}

/// One ranked catalog row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchMatch {
    pub id: ProductId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub price: Option<f64>,
    /// Higher is more similar.
    pub similarity: f64,
}

/// All matches for one detected region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionMatches {
    #[serde(rename = "object_label")]
    pub label: String,
    pub matches: Vec<SearchMatch>,
}

/// A region label paired with its embedding.
#[derive(Debug, Clone)]
pub struct EmbeddedRegion {
    pub label: String,
    pub embedding: EmbeddingVector,
}

#[derive(Debug, Clone, Copy)]
pub struct SearchParams {
    pub match_threshold: f64,
    pub match_count: usize,
    pub timeout: Duration,
}

/// An external vector-similarity operator over the product catalog.
#[async_trait]
pub trait SimilaritySearch: Send + Sync {
    async fn search(
        &self,
        embedding: &[f32],
        match_threshold: f64,
        match_count: usize,
    ) -> Result<Vec<SearchMatch>, SearchError>;
}

/// Applies the threshold and cap, ordering by similarity (stable on ties).
pub fn rank_matches(mut rows: Vec<SearchMatch>, match_threshold: f64, match_count: usize) -> Vec<SearchMatch> {
    rows.retain(|row| row.similarity.is_finite() && row.similarity >= match_threshold);
    rows.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    rows.truncate(match_count);
    rows
}

/// Queries every region concurrently. Output order equals input order.
pub async fn search_regions(
    search: &dyn SimilaritySearch,
    regions: Vec<EmbeddedRegion>,
    params: SearchParams,
) -> Vec<RegionMatches> {
    let queries = regions.into_iter().enumerate().map(|(index, region)| async move {
        let outcome = match tokio::time::timeout(
            params.timeout,
            search.search(&region.embedding, params.match_threshold, params.match_count),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SearchError::Timeout(params.timeout.as_millis())),
        };

        let matches = match outcome {
            Ok(rows) => rank_matches(rows, params.match_threshold, params.match_count),
            Err(err) => {
                tracing::warn!(
                    region = index,
                    label = %region.label,
                    error = %err,
                    "similarity search failed, region gets no matches"
                );
                Vec::new()
            }
        };

        RegionMatches {
            label: region.label,
            matches,
        }
    });

    join_all(queries).await
}

/// Settings for [`HttpSimilaritySearch`].
#[derive(Debug, Clone)]
pub struct SearchSettings {
    /// Project URL of the PostgREST deployment, e.g. `https://xyz.supabase.co`.
    pub base_url: String,
    pub api_key: String,
    /// Name of the stored procedure performing the vector match.
    pub function: String,
    pub timeout: Duration,
}

/// PostgREST RPC client for a `match_*` similarity function.
#[derive(Clone)]
pub struct HttpSimilaritySearch {
    client: Client,
    endpoint: String,
}

impl HttpSimilaritySearch {
    pub fn new(settings: SearchSettings) -> Result<Self, SearchError> {
        let config_error = |message: String| SearchError::Upstream(UpstreamFailure::unreachable(message));
        if settings.function.trim().is_empty() {
            return Err(config_error("missing similarity function name".into()));
        }

        let mut headers = HeaderMap::new();
        if !settings.api_key.trim().is_empty() {
            let key = settings.api_key.trim();
            headers.insert(
                "apikey",
                HeaderValue::from_str(key).map_err(|_| config_error("invalid search API key".into()))?,
            );
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {key}"))
                    .map_err(|_| config_error("invalid search API key".into()))?,
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(settings.timeout)
            .default_headers(headers)
            .build()
            .map_err(|err| config_error(format!("failed to build search HTTP client: {err}")))?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}/rest/v1/rpc/{}",
                settings.base_url.trim_end_matches('/'),
                settings.function.trim()
            ),
        })
    }
}

#[derive(Serialize)]
struct MatchRequest<'a> {
    query_embedding: &'a [f32],
    match_threshold: f64,
    match_count: usize,
}

#[async_trait]
impl SimilaritySearch for HttpSimilaritySearch {
    async fn search(
        &self,
        embedding: &[f32],
        match_threshold: f64,
        match_count: usize,
    ) -> Result<Vec<SearchMatch>, SearchError> {
        let request = MatchRequest {
            query_embedding: embedding,
            match_threshold,
            match_count,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|err| SearchError::Upstream(UpstreamFailure::unreachable(err.to_string())))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<body unavailable>".to_string());
        if !status.is_success() {
            return Err(SearchError::Upstream(UpstreamFailure::new(Some(status.as_u16()), body)));
        }
        serde_json::from_str(&body).map_err(|err| SearchError::Malformed(format!("{err}: {body}")))
    }
}
