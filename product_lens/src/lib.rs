// THEORY:
// This file is the main entry point for the `product_lens` library crate.
// It exports the `VisualSearchPipeline` and its associated data structures
// (`PipelineConfig`, `RegionMatches`, `PipelineError`, etc.) as the high-level
// interface for the visual search engine. Front ends such as the HTTP server
// depend on this surface only.
//
// The stage implementations live in `core_modules`. Each external collaborator
// (detector, embedding provider, similarity index) sits behind an async trait
// there, with an HTTP client as the production implementation, so the pipeline
// can be driven end to end with in-process fakes.

pub mod core_modules;
pub mod error;
pub mod pipeline;
pub mod worker_pool;

pub use core_modules::embedding_client::{
    EmbeddingMode, EmbeddingProvider, EmbeddingSettings, EmbeddingVector, HttpEmbeddingClient,
};
pub use core_modules::image_normalizer::RawImage;
pub use core_modules::region_detector::{DetectorSettings, HttpRegionDetector, RegionDetector};
pub use core_modules::similarity_search::{HttpSimilaritySearch, SearchSettings, SimilaritySearch};
pub use error::{PipelineError, SearchError, UpstreamFailure};
pub use pipeline::{
    PipelineConfig, PipelineResult, PipelineStage, ProductId, RegionMatches, SearchMatch, VisualSearchPipeline,
};
pub use worker_pool::CpuPool;
