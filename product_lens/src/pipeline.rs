// THEORY:
// The `pipeline` module is the top-level API of the visual search engine. It
// sequences the five stages for one photo and is the only code that knows their
// order:
//
//   Received -> Normalized -> Detected -> Cropped -> Embedded -> Searched -> Done
//
// Key architectural principles:
// 1.  **Strict sequencing**: no stage starts before its predecessor's full output
//     exists. The only parallelism inside an invocation is stage 5's per-region
//     fan-out.
// 2.  **All-or-nothing at the request level**: any fatal `PipelineError` ends the
//     invocation and discards partial work. Partial success exists only per
//     region, inside the similarity aggregator.
// 3.  **Scoped image ownership**: the working bitmap is moved into the cropping
//     job and dropped there; after stage 3 only compact JPEG crops, and after
//     stage 4 only labels and vectors, are alive.
// 4.  **Bounded upstream calls**: every external call carries a timeout. Optional
//     retries apply only to transient detector/embedding failures and stop at
//     the first success.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::core_modules::embedding_client::{EmbeddingProvider, embed_regions};
use crate::core_modules::image_normalizer::{RawImage, normalize};
use crate::core_modules::region_cropper::{CropSettings, crop_regions};
use crate::core_modules::region_detector::{RegionDetector, detect_regions};
use crate::core_modules::similarity_search::{EmbeddedRegion, SearchParams, SimilaritySearch, search_regions};
use crate::error::{PipelineError, UpstreamFailure};
use crate::worker_pool::CpuPool;

// Re-export key data structures for the public API.
pub use crate::core_modules::detection::Detection;
pub use crate::core_modules::region_cropper::{CropRegion, PixelBox};
pub use crate::core_modules::similarity_search::{ProductId, RegionMatches, SearchMatch};

/// Ordered per-region matches, one entry per surviving crop, in detection order.
pub type PipelineResult = Vec<RegionMatches>;

const MAX_BACKOFF_DOUBLINGS: u32 = 5;

/// Tunable behavior of the pipeline. Immutable once the pipeline is built.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Cap on the longer side of the working image, in pixels.
    pub max_dimension: u32,
    /// Only the first `max_regions` detections are cropped.
    pub max_regions: usize,
    /// Crops narrower or shorter than this are discarded.
    pub min_crop_px: u32,
    pub crop_jpeg_quality: u8,
    pub detector_jpeg_quality: u8,
    /// Expected length of every embedding vector.
    pub embedding_dimensions: usize,
    pub match_threshold: f64,
    pub match_count: usize,
    pub detector_timeout: Duration,
    pub embedding_timeout: Duration,
    pub search_timeout: Duration,
    /// Attempts per detector/embedding call; 1 disables retries.
    pub max_attempts: usize,
    /// Delay before the first retry, doubled on each further retry.
    pub retry_backoff: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_dimension: 800,
            max_regions: 3,
            min_crop_px: 5,
            crop_jpeg_quality: 80,
            detector_jpeg_quality: 85,
            embedding_dimensions: 1024,
            match_threshold: 0.6,
            match_count: 50,
            detector_timeout: Duration::from_secs(30),
            embedding_timeout: Duration::from_secs(30),
            search_timeout: Duration::from_secs(10),
            max_attempts: 1,
            retry_backoff: Duration::from_millis(250),
        }
    }
}

impl PipelineConfig {
    /// Rejects settings no invocation could succeed with.
    pub fn validate(&self) -> Result<(), String> {
        let checks = [
            (self.max_dimension > 0, "max_dimension must be positive"),
            (self.max_regions > 0, "max_regions must be positive"),
            (self.min_crop_px > 0, "min_crop_px must be positive"),
            ((1..=100).contains(&self.crop_jpeg_quality), "crop_jpeg_quality must be within 1..=100"),
            ((1..=100).contains(&self.detector_jpeg_quality), "detector_jpeg_quality must be within 1..=100"),
            (self.embedding_dimensions > 0, "embedding_dimensions must be positive"),
            ((-1.0..=1.0).contains(&self.match_threshold), "match_threshold must be within [-1, 1]"),
            (self.match_count > 0, "match_count must be positive"),
            (self.max_attempts > 0, "max_attempts must be positive"),
            (!self.detector_timeout.is_zero(), "detector_timeout must be positive"),
            (!self.embedding_timeout.is_zero(), "embedding_timeout must be positive"),
            (!self.search_timeout.is_zero(), "search_timeout must be positive"),
        ];
        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, message)) => Err((*message).to_string()),
            None => Ok(()),
        }
    }

    fn crop_settings(&self) -> CropSettings {
        CropSettings {
            max_regions: self.max_regions,
            min_crop_px: self.min_crop_px,
            jpeg_quality: self.crop_jpeg_quality,
        }
    }

    fn search_params(&self) -> SearchParams {
        SearchParams {
            match_threshold: self.match_threshold,
            match_count: self.match_count,
            timeout: self.search_timeout,
        }
    }
}

/// Progress of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Received,
    Normalized,
    Detected,
    Cropped,
    Embedded,
    Searched,
    Done,
}

/// The main, top-level struct for the visual search engine.
pub struct VisualSearchPipeline {
    config: Arc<PipelineConfig>,
    detector: Arc<dyn RegionDetector>,
    embedder: Arc<dyn EmbeddingProvider>,
    search: Arc<dyn SimilaritySearch>,
    cpu: CpuPool,
}

impl VisualSearchPipeline {
    pub fn new(
        config: PipelineConfig,
        detector: Arc<dyn RegionDetector>,
        embedder: Arc<dyn EmbeddingProvider>,
        search: Arc<dyn SimilaritySearch>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            detector,
            embedder,
            search,
            cpu: CpuPool::default(),
        }
    }

    pub fn with_cpu_pool(mut self, cpu: CpuPool) -> Self {
        self.cpu = cpu;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs one full invocation for a single photo.
    #[tracing::instrument(name = "visual_search", skip_all)]
    pub async fn run(&self, raw: RawImage) -> Result<PipelineResult, PipelineError> {
        let mut stage = PipelineStage::Received;
        let outcome = self.execute(raw, &mut stage).await;
        match &outcome {
            Ok(results) => tracing::info!(regions = results.len(), "visual search complete"),
            Err(err) => tracing::warn!(
                last_completed = ?stage,
                kind = err.kind(),
                error = %err,
                "visual search failed"
            ),
        }
        outcome
    }

    async fn execute(&self, raw: RawImage, stage: &mut PipelineStage) -> Result<PipelineResult, PipelineError> {
        let config = self.config.clone();

        // Stage 1: Normalization (off the async threads)
        let (max_dimension, detector_quality) = (config.max_dimension, config.detector_jpeg_quality);
        let (image, image_uri) = self
            .cpu
            .run(move || {
                let image = normalize(raw, max_dimension)?;
                let image_uri = image.to_jpeg_data_uri(detector_quality)?;
                Ok((image, image_uri))
            })
            .await?;
        advance(stage, PipelineStage::Normalized, image.width() as usize);

        // Stage 2: Region Detection
        let detector = self.detector.as_ref();
        let uri = image_uri.as_str();
        let detections = self
            .call_with_retries("detection", config.detector_timeout, PipelineError::DetectionService, move || {
                detect_regions(detector, uri)
            })
            .await?;
        drop(image_uri);
        advance(stage, PipelineStage::Detected, detections.len());

        // Stage 3: Cropping. The working image is moved in and dropped there.
        let crop_settings = config.crop_settings();
        let regions = self
            .cpu
            .run(move || crop_regions(image, detections, crop_settings))
            .await?;
        advance(stage, PipelineStage::Cropped, regions.len());

        // Stage 4: Batched Embedding
        let embedder = self.embedder.as_ref();
        let crops = regions.as_slice();
        let dimensions = config.embedding_dimensions;
        let vectors = self
            .call_with_retries("embedding", config.embedding_timeout, PipelineError::EmbeddingService, move || {
                embed_regions(embedder, crops, dimensions)
            })
            .await?;
        advance(stage, PipelineStage::Embedded, vectors.len());

        // Stage 5: Concurrent Similarity Search
        let embedded: Vec<EmbeddedRegion> = regions
            .into_iter()
            .zip(vectors)
            .map(|(region, embedding)| EmbeddedRegion {
                label: region.label,
                embedding,
            })
            .collect();
        let results = search_regions(self.search.as_ref(), embedded, config.search_params()).await;
        advance(stage, PipelineStage::Searched, results.len());

        *stage = PipelineStage::Done;
        Ok(results)
    }

    /// Wraps an upstream call in its timeout and the configured retry policy.
    async fn call_with_retries<T, F, Fut>(
        &self,
        call_name: &'static str,
        timeout: Duration,
        timeout_error: fn(UpstreamFailure) -> PipelineError,
        mut call: F,
    ) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(timeout_error(UpstreamFailure::unreachable(format!(
                    "{call_name} call timed out after {} ms",
                    timeout.as_millis()
                )))),
            };

            match result {
                Err(err) if err.is_transient() && attempt < attempts => {
                    let backoff = retry_backoff(self.config.retry_backoff, attempt);
                    tracing::warn!(
                        call = call_name,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "retrying transient upstream failure"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

fn advance(stage: &mut PipelineStage, next: PipelineStage, count: usize) {
    tracing::debug!(from = ?*stage, to = ?next, count, "stage complete");
    *stage = next;
}

fn retry_backoff(base: Duration, attempt: usize) -> Duration {
    let doublings = (attempt.saturating_sub(1) as u32).min(MAX_BACKOFF_DOUBLINGS);
    base * (1u32 << doublings)
}
