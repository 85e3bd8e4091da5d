// THEORY:
// `ApiError` is the single place where failures become HTTP. The pipeline only
// raises typed `PipelineError`s; this module picks the status and renders the
// `{ "error", "kind" }` envelope. Legacy mode answers every failure with 500 so
// older clients that only look at the envelope keep working. Oversized bodies
// stay 413 in both modes.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use product_lens::PipelineError;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    kind: &'a str,
}

impl ApiError {
    pub fn from_pipeline(err: &PipelineError, legacy: bool) -> Self {
        let status = if legacy {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            pipeline_status(err)
        };
        Self {
            status,
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn from_rejection(rejection: JsonRejection, legacy: bool) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            return Self {
                status: StatusCode::PAYLOAD_TOO_LARGE,
                kind: "payload_too_large",
                message: rejection.body_text(),
            };
        }
        Self {
            status: if legacy {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                StatusCode::BAD_REQUEST
            },
            kind: "invalid_request",
            message: rejection.body_text(),
        }
    }
}

fn pipeline_status(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::InvalidInput(_) | PipelineError::Decode(_) => StatusCode::BAD_REQUEST,
        PipelineError::NoRegions => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::DetectionService(_)
        | PipelineError::DetectionFormat(_)
        | PipelineError::EmbeddingService(_)
        | PipelineError::EmbeddingCountMismatch { .. } => StatusCode::BAD_GATEWAY,
        PipelineError::Worker(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, kind = self.kind, error = %self.message, "request failed");
        } else {
            tracing::info!(status = %self.status, kind = self.kind, error = %self.message, "request rejected");
        }
        let body = ErrorBody {
            error: &self.message,
            kind: self.kind,
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use product_lens::UpstreamFailure;

    #[test]
    fn user_errors_map_to_client_statuses() {
        let invalid = ApiError::from_pipeline(&PipelineError::InvalidInput("empty".into()), false);
        assert_eq!(invalid.status, StatusCode::BAD_REQUEST);
        assert_eq!(invalid.kind, "invalid_input");

        let decode = ApiError::from_pipeline(&PipelineError::Decode("garbage".into()), false);
        assert_eq!(decode.status, StatusCode::BAD_REQUEST);

        let none = ApiError::from_pipeline(&PipelineError::NoRegions, false);
        assert_eq!(none.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(none.kind, "no_regions");
    }

    #[test]
    fn upstream_errors_map_to_bad_gateway() {
        let upstream = UpstreamFailure::new(Some(503), "overloaded");
        for err in [
            PipelineError::DetectionService(upstream.clone()),
            PipelineError::DetectionFormat("prose".into()),
            PipelineError::EmbeddingService(upstream),
            PipelineError::EmbeddingCountMismatch { expected: 3, actual: 2 },
        ] {
            assert_eq!(ApiError::from_pipeline(&err, false).status, StatusCode::BAD_GATEWAY);
        }
        let worker = ApiError::from_pipeline(&PipelineError::Worker("panicked".into()), false);
        assert_eq!(worker.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn legacy_mode_collapses_to_500_and_keeps_message() {
        let err = PipelineError::NoRegions;
        let legacy = ApiError::from_pipeline(&err, true);
        assert_eq!(legacy.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(legacy.message, err.to_string());
        assert_eq!(legacy.kind, "no_regions");
    }
}
