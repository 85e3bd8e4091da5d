// THEORY:
// Every stage of the search pipeline reports failure through one typed taxonomy.
// Stages never build wire-format error bodies themselves; they return a
// `PipelineError` and the caller decides how to present it. The only non-fatal
// failure, a single region's similarity query going wrong, has its own type
// (`SearchError`) so it cannot accidentally be propagated with `?` into the
// fatal path.

use std::fmt;

/// Diagnostic payload captured from an upstream service call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamFailure {
    /// HTTP status returned by the service, `None` when no response arrived
    /// (connection failure, timeout).
    pub status: Option<u16>,
    /// Upstream-provided body or a local description of what went wrong.
    pub message: String,
}

impl UpstreamFailure {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// A failure with no response at all, e.g. a refused connection.
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(None, message)
    }

    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self.status {
            None => true,
            Some(status) => status == 429 || status >= 500,
        }
    }
}

impl fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "status {status}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Fatal pipeline failures. Any of these terminates the invocation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    InvalidInput(String),

    #[error("could not decode image: {0}")]
    Decode(String),

    #[error("detection service failed ({0})")]
    DetectionService(UpstreamFailure),

    #[error("detection output is not a usable JSON array: {0}")]
    DetectionFormat(String),

    #[error("no product regions detected in the image")]
    NoRegions,

    #[error("embedding service failed ({0})")]
    EmbeddingService(UpstreamFailure),

    #[error("embedding service returned {actual} vectors for {expected} regions")]
    EmbeddingCountMismatch { expected: usize, actual: usize },

    #[error("image worker failed: {0}")]
    Worker(String),
}

impl PipelineError {
    /// Stable identifier for the error kind, suitable for logs and payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::InvalidInput(_) => "invalid_input",
            PipelineError::Decode(_) => "decode_error",
            PipelineError::DetectionService(_) => "detection_service_error",
            PipelineError::DetectionFormat(_) => "detection_format_error",
            PipelineError::NoRegions => "no_regions",
            PipelineError::EmbeddingService(_) => "embedding_service_error",
            PipelineError::EmbeddingCountMismatch { .. } => "embedding_count_mismatch",
            PipelineError::Worker(_) => "worker_error",
        }
    }

    /// True for failures caused by the caller's input rather than by a service.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            PipelineError::InvalidInput(_) | PipelineError::Decode(_) | PipelineError::NoRegions
        )
    }

    /// True when retrying the same upstream call might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::DetectionService(failure) | PipelineError::EmbeddingService(failure) => {
                failure.is_transient()
            }
            _ => false,
        }
    }
}

/// Failure of a single region's similarity query. Never fatal.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SearchError {
    #[error("similarity search failed ({0})")]
    Upstream(UpstreamFailure),

    #[error("similarity search returned an unreadable body: {0}")]
    Malformed(String),

    #[error("similarity search timed out after {0} ms")]
    Timeout(u128),
}
