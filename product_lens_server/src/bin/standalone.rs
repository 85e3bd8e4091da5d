use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use clap::Parser;
use product_lens::{
    CpuPool, DetectorSettings, EmbeddingSettings, HttpEmbeddingClient, HttpRegionDetector, HttpSimilaritySearch,
    PipelineConfig, SearchSettings, VisualSearchPipeline,
};
use product_lens_server::{DEFAULT_BODY_LIMIT, ServerConfig, start_server};

#[derive(Parser, Debug)]
#[command(
    name = "product-lens-server",
    version,
    about = "HTTP endpoint that finds catalog products matching the items in a photo"
)]
struct Cli {
    /// Address to bind the HTTP server to (host:port).
    #[arg(long, env = "PRODUCT_LENS_BIND", default_value = "127.0.0.1:3001")]
    bind: String,

    /// Largest accepted request body, in bytes.
    #[arg(long, env = "PRODUCT_LENS_BODY_LIMIT", default_value_t = DEFAULT_BODY_LIMIT)]
    body_limit: usize,

    /// Answer every failure with HTTP 500, as older clients expect.
    #[arg(long, env = "PRODUCT_LENS_LEGACY_ERRORS")]
    legacy_errors: bool,

    /// Base URL of the OpenAI-compatible vision model API.
    #[arg(long, env = "PRODUCT_LENS_DETECTOR_URL", default_value = "https://openrouter.ai/api/v1")]
    detector_url: String,

    #[arg(long, env = "PRODUCT_LENS_DETECTOR_API_KEY", hide_env_values = true)]
    detector_api_key: String,

    #[arg(long, env = "PRODUCT_LENS_DETECTOR_MODEL", default_value = "qwen/qwen2.5-vl-72b-instruct")]
    detector_model: String,

    #[arg(long, env = "PRODUCT_LENS_DETECTOR_MAX_TOKENS", default_value_t = 1024)]
    detector_max_tokens: u32,

    /// Full URL of the embeddings endpoint.
    #[arg(long, env = "PRODUCT_LENS_EMBEDDING_URL", default_value = "https://api.jina.ai/v1/embeddings")]
    embedding_url: String,

    #[arg(long, env = "PRODUCT_LENS_EMBEDDING_API_KEY", hide_env_values = true)]
    embedding_api_key: String,

    #[arg(long, env = "PRODUCT_LENS_EMBEDDING_MODEL", default_value = "jina-embeddings-v4")]
    embedding_model: String,

    /// Do not send `dimensions` with embedding requests.
    #[arg(long, env = "PRODUCT_LENS_EMBEDDING_NATIVE_DIMENSIONS")]
    embedding_native_dimensions: bool,

    /// Project URL of the PostgREST deployment holding the catalog.
    #[arg(long, env = "PRODUCT_LENS_SEARCH_URL")]
    search_url: String,

    #[arg(long, env = "PRODUCT_LENS_SEARCH_API_KEY", hide_env_values = true)]
    search_api_key: String,

    /// Stored procedure performing the vector match.
    #[arg(long, env = "PRODUCT_LENS_SEARCH_FUNCTION", default_value = "match_products")]
    search_function: String,

    #[arg(long, env = "PRODUCT_LENS_MAX_DIMENSION", default_value_t = 800)]
    max_dimension: u32,

    #[arg(long, env = "PRODUCT_LENS_MAX_REGIONS", default_value_t = 3)]
    max_regions: usize,

    #[arg(long, env = "PRODUCT_LENS_MIN_CROP_PX", default_value_t = 5)]
    min_crop_px: u32,

    #[arg(long, env = "PRODUCT_LENS_CROP_JPEG_QUALITY", default_value_t = 80)]
    crop_jpeg_quality: u8,

    #[arg(long, env = "PRODUCT_LENS_DETECTOR_JPEG_QUALITY", default_value_t = 85)]
    detector_jpeg_quality: u8,

    #[arg(long, env = "PRODUCT_LENS_EMBEDDING_DIMENSIONS", default_value_t = 1024)]
    embedding_dimensions: usize,

    #[arg(long, env = "PRODUCT_LENS_MATCH_THRESHOLD", default_value_t = 0.6)]
    match_threshold: f64,

    #[arg(long, env = "PRODUCT_LENS_MATCH_COUNT", default_value_t = 50)]
    match_count: usize,

    #[arg(long, env = "PRODUCT_LENS_DETECTOR_TIMEOUT_MS", default_value_t = 30_000)]
    detector_timeout_ms: u64,

    #[arg(long, env = "PRODUCT_LENS_EMBEDDING_TIMEOUT_MS", default_value_t = 30_000)]
    embedding_timeout_ms: u64,

    #[arg(long, env = "PRODUCT_LENS_SEARCH_TIMEOUT_MS", default_value_t = 10_000)]
    search_timeout_ms: u64,

    /// Attempts per detector/embedding call; 1 disables retries.
    #[arg(long, env = "PRODUCT_LENS_MAX_ATTEMPTS", default_value_t = 1)]
    max_attempts: usize,

    #[arg(long, env = "PRODUCT_LENS_RETRY_BACKOFF_MS", default_value_t = 250)]
    retry_backoff_ms: u64,

    /// Concurrent image jobs; defaults to the number of logical cores.
    #[arg(long, env = "PRODUCT_LENS_CPU_WORKERS")]
    cpu_workers: Option<usize>,
}

impl Cli {
    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            max_dimension: self.max_dimension,
            max_regions: self.max_regions,
            min_crop_px: self.min_crop_px,
            crop_jpeg_quality: self.crop_jpeg_quality,
            detector_jpeg_quality: self.detector_jpeg_quality,
            embedding_dimensions: self.embedding_dimensions,
            match_threshold: self.match_threshold,
            match_count: self.match_count,
            detector_timeout: Duration::from_millis(self.detector_timeout_ms),
            embedding_timeout: Duration::from_millis(self.embedding_timeout_ms),
            search_timeout: Duration::from_millis(self.search_timeout_ms),
            max_attempts: self.max_attempts,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.pipeline_config();
    config
        .validate()
        .map_err(|reason| anyhow!("invalid pipeline configuration: {reason}"))?;

    let detector = HttpRegionDetector::new(DetectorSettings {
        base_url: cli.detector_url.clone(),
        api_key: cli.detector_api_key.clone(),
        model: cli.detector_model.clone(),
        timeout: config.detector_timeout,
        max_tokens: cli.detector_max_tokens,
    })
    .context("building detector client")?;

    let embedder = HttpEmbeddingClient::new(EmbeddingSettings {
        endpoint: cli.embedding_url.clone(),
        api_key: cli.embedding_api_key.clone(),
        model: cli.embedding_model.clone(),
        dimensions: (!cli.embedding_native_dimensions).then_some(config.embedding_dimensions),
        timeout: config.embedding_timeout,
    })
    .context("building embedding client")?;

    let search = HttpSimilaritySearch::new(SearchSettings {
        base_url: cli.search_url.clone(),
        api_key: cli.search_api_key.clone(),
        function: cli.search_function.clone(),
        timeout: config.search_timeout,
    })
    .context("building similarity search client")?;

    let cpu = cli.cpu_workers.map(CpuPool::new).unwrap_or_default();
    tracing::info!(
        detector_model = %cli.detector_model,
        embedding_model = %cli.embedding_model,
        search_function = %cli.search_function,
        cpu_workers = cpu.size(),
        "pipeline configured"
    );

    let pipeline = VisualSearchPipeline::new(config, Arc::new(detector), Arc::new(embedder), Arc::new(search))
        .with_cpu_pool(cpu);
    let server_cfg = ServerConfig {
        bind_addr: cli.bind,
        legacy_errors: cli.legacy_errors,
        body_limit: cli.body_limit,
    };

    let handle = start_server(Arc::new(pipeline), server_cfg).await?;
    handle.await.context("server task panicked")?;
    Ok(())
}
