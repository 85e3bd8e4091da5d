// THEORY:
// The server crate is a thin HTTP shell around `product_lens`. Each POST runs one
// independent pipeline invocation under its own request span; the only state
// shared between requests is the immutable pipeline (configuration plus
// stateless collaborator clients) behind an `Arc`.
//
// Routes:
//   POST /, POST /search   { "image_base64": "..." } -> { "detected_objects": [...] }
//   GET  /healthz          liveness probe
// CORS is permissive on every route and every response, errors included, and
// preflight requests are answered by the CORS layer before routing.

pub mod error;

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderName, Method};
use axum::routing::{get, post};
use axum::{Json, Router};
use product_lens::{RawImage, RegionMatches, VisualSearchPipeline};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::error::ApiError;

pub const DEFAULT_BODY_LIMIT: usize = 20 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Answer every failure with 500 instead of a kind-specific status.
    pub legacy_errors: bool,
    /// Largest accepted request body, in bytes.
    pub body_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3001".to_string(),
            legacy_errors: false,
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<VisualSearchPipeline>,
    legacy_errors: bool,
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub image_base64: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResponse {
    pub detected_objects: Vec<RegionMatches>,
}

pub fn router(pipeline: Arc<VisualSearchPipeline>, cfg: &ServerConfig) -> Router {
    let state = AppState {
        pipeline,
        legacy_errors: cfg.legacy_errors,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            AUTHORIZATION,
            HeaderName::from_static("x-client-info"),
            HeaderName::from_static("apikey"),
            CONTENT_TYPE,
        ]);

    Router::new()
        .route("/", post(search))
        .route("/search", post(search))
        .route("/healthz", get(|| async { "ok" }))
        .layer(DefaultBodyLimit::max(cfg.body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn search(
    State(state): State<AppState>,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<SearchResponse>, ApiError> {
    let request_id = uuid::Uuid::new_v4();
    let span = tracing::info_span!("search_request", %request_id);

    async move {
        let Json(request) = payload.map_err(|rejection| ApiError::from_rejection(rejection, state.legacy_errors))?;
        let detected_objects = state
            .pipeline
            .run(RawImage::from_base64(request.image_base64))
            .await
            .map_err(|err| ApiError::from_pipeline(&err, state.legacy_errors))?;
        Ok(Json(SearchResponse { detected_objects }))
    }
    .instrument(span)
    .await
}

/// Binds `cfg.bind_addr` and serves until Ctrl-C.
pub async fn start_server(
    pipeline: Arc<VisualSearchPipeline>,
    cfg: ServerConfig,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let app = router(pipeline, &cfg);
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(
        addr = %local_addr,
        legacy_errors = cfg.legacy_errors,
        body_limit = cfg.body_limit,
        "product lens server listening"
    );

    let server = tokio::spawn(async move {
        let shutdown = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutdown signal received");
        };
        if let Err(err) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
            tracing::error!(error = %err, "server stopped with error");
        }
    });
    Ok(server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use product_lens::{
        EmbeddingMode, EmbeddingProvider, EmbeddingVector, PipelineConfig, PipelineError, ProductId, RegionDetector,
        SearchError, SearchMatch, SimilaritySearch,
    };
    use std::io::Cursor;
    use tower::ServiceExt; // for oneshot

    struct FixedDetector(&'static str);

    #[async_trait]
    impl RegionDetector for FixedDetector {
        async fn describe(&self, _image_data_uri: &str, _instruction: &str) -> Result<String, PipelineError> {
            Ok(self.0.to_string())
        }
    }

    struct UnitEmbedder;

    #[async_trait]
    impl EmbeddingProvider for UnitEmbedder {
        async fn embed_images(
            &self,
            image_data_uris: &[String],
            _mode: EmbeddingMode,
        ) -> Result<Vec<EmbeddingVector>, PipelineError> {
            Ok(image_data_uris.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    struct OneRowSearch;

    #[async_trait]
    impl SimilaritySearch for OneRowSearch {
        async fn search(
            &self,
            _embedding: &[f32],
            _threshold: f64,
            _count: usize,
        ) -> Result<Vec<SearchMatch>, SearchError> {
            Ok(vec![SearchMatch {
                id: ProductId::Number(7),
                name: "Canvas Tote".into(),
                price: Some(24.5),
                similarity: 0.88,
            }])
        }
    }

    fn app(detector_answer: &'static str, cfg: ServerConfig) -> Router {
        let config = PipelineConfig {
            embedding_dimensions: 2,
            ..PipelineConfig::default()
        };
        let pipeline = VisualSearchPipeline::new(
            config,
            Arc::new(FixedDetector(detector_answer)),
            Arc::new(UnitEmbedder),
            Arc::new(OneRowSearch),
        );
        router(Arc::new(pipeline), &cfg)
    }

    fn png_base64() -> String {
        let image = RgbImage::from_pixel(64, 48, Rgb([30, 90, 160]));
        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image)
            .write_to(&mut cursor, ImageFormat::Png)
            .unwrap();
        STANDARD.encode(cursor.into_inner())
    }

    fn post_json(uri: &str, body: String) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .header("origin", "https://shop.example")
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    const TOTE: &str = r#"[{"label":"tote bag","bbox":[100,100,900,900]}]"#;

    #[tokio::test]
    async fn search_returns_detected_objects() {
        let body = serde_json::json!({ "image_base64": format!("data:image/png;base64,{}", png_base64()) });
        for uri in ["/", "/search"] {
            let response = app(TOTE, ServerConfig::default())
                .oneshot(post_json(uri, body.to_string()))
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()["access-control-allow-origin"], "*");
            let json = json_body(response).await;
            assert_eq!(
                json,
                serde_json::json!({
                    "detected_objects": [{
                        "object_label": "tote bag",
                        "matches": [{ "id": 7, "name": "Canvas Tote", "price": 24.5, "similarity": 0.88 }]
                    }]
                })
            );
        }
    }

    #[tokio::test]
    async fn empty_image_is_bad_request_with_cors() {
        let response = app(TOTE, ServerConfig::default())
            .oneshot(post_json("/", r#"{"image_base64":""}"#.into()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
        let json = json_body(response).await;
        assert_eq!(json["kind"], "invalid_input");
        assert!(json["error"].as_str().is_some_and(|m| !m.is_empty()));
    }

    #[tokio::test]
    async fn malformed_json_is_bad_request() {
        let response = app(TOTE, ServerConfig::default())
            .oneshot(post_json("/", "{not json".into()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["kind"], "invalid_request");
    }

    #[tokio::test]
    async fn no_regions_is_unprocessable_unless_legacy() {
        let body = serde_json::json!({ "image_base64": png_base64() }).to_string();

        let response = app("[]", ServerConfig::default())
            .oneshot(post_json("/", body.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json_body(response).await["kind"], "no_regions");

        let legacy = ServerConfig {
            legacy_errors: true,
            ..ServerConfig::default()
        };
        let response = app("[]", legacy).oneshot(post_json("/", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
        assert!(json_body(response).await["error"].is_string());
    }

    #[tokio::test]
    async fn unparseable_detector_output_is_bad_gateway() {
        let body = serde_json::json!({ "image_base64": png_base64() }).to_string();
        let response = app("no products here", ServerConfig::default())
            .oneshot(post_json("/search", body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(json_body(response).await["kind"], "detection_format_error");
    }

    #[tokio::test]
    async fn preflight_is_answered_with_permissive_cors() {
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/")
            .header("origin", "https://shop.example")
            .header("access-control-request-method", "POST")
            .header("access-control-request-headers", "content-type,apikey")
            .body(Body::empty())
            .unwrap();

        let response = app(TOTE, ServerConfig::default()).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers["access-control-allow-origin"], "*");
        let methods = headers["access-control-allow-methods"].to_str().unwrap();
        assert!(methods.contains("POST") && methods.contains("OPTIONS"));
        let allowed = headers["access-control-allow-headers"].to_str().unwrap();
        assert!(allowed.contains("apikey") && allowed.contains("x-client-info"));
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let cfg = ServerConfig {
            body_limit: 256,
            ..ServerConfig::default()
        };
        let body = serde_json::json!({ "image_base64": "A".repeat(4096) }).to_string();

        let response = app(TOTE, cfg).oneshot(post_json("/", body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn healthz_answers_ok() {
        let request = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
        let response = app(TOTE, ServerConfig::default()).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"ok");
    }
}
