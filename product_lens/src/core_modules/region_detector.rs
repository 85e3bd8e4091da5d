// THEORY:
// The `RegionDetector` adapter is the pipeline's bridge to an external
// vision-language model. The model receives the normalized image plus an
// instruction that pins down the answer format as tightly as prose allows, and
// answers with free text. The adapter's only job on the network side is to get
// that text back; turning it into `Detection`s is left to the `detection`
// parser so the two can fail, and be tested, independently.
//
// The trait is the seam for tests and for swapping providers. The default
// implementation speaks the OpenAI-compatible chat-completions protocol, which
// most hosted VLM gateways expose.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core_modules::detection::{Detection, parse_detections};
use crate::error::{PipelineError, UpstreamFailure};

/// Instruction sent alongside every image.
pub const DETECTION_INSTRUCTION: &str = "Find every distinct product a shopper could buy in this photo \
(clothing, shoes, bags, accessories, electronics, furniture, home goods and similar). \
Respond ONLY with a strict JSON array and nothing else: no markdown, no code fences, no commentary. \
Each element must be an object of the form {\"label\": \"<short English product name>\", \"bbox\": [x1, y1, x2, y2]}. \
Coordinates are integers from 0 to 1000 giving thousandths of the image width (x) and height (y); \
(x1, y1) is the top-left corner and (x2, y2) the bottom-right corner. \
Use double quotes for every key and string value. Labels must be in English. \
If no products are visible, respond with [].";

/// An external service that answers an instruction about an image with free text.
#[async_trait]
pub trait RegionDetector: Send + Sync {
    async fn describe(&self, image_data_uri: &str, instruction: &str) -> Result<String, PipelineError>;
}

/// Asks the detector for product regions and recovers the detection list.
pub async fn detect_regions(
    detector: &dyn RegionDetector,
    image_data_uri: &str,
) -> Result<Vec<Detection>, PipelineError> {
    let answer = detector.describe(image_data_uri, DETECTION_INSTRUCTION).await?;
    tracing::debug!(answer_len = answer.len(), "detector answered");
    parse_detections(&answer)
}

/// Settings for [`HttpRegionDetector`].
#[derive(Debug, Clone)]
pub struct DetectorSettings {
    /// Base URL of an OpenAI-compatible API, e.g. `https://openrouter.ai/api/v1`.
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
    pub max_tokens: u32,
}

/// Chat-completions client for vision-language detectors.
#[derive(Clone)]
pub struct HttpRegionDetector {
    client: Client,
    endpoint: String,
    model: String,
    max_tokens: u32,
}

impl HttpRegionDetector {
    pub fn new(settings: DetectorSettings) -> Result<Self, PipelineError> {
        let config_error = |message: String| {
            PipelineError::DetectionService(UpstreamFailure::unreachable(message))
        };
        if settings.model.trim().is_empty() {
            return Err(config_error("missing detector model name".into()));
        }

        let mut headers = HeaderMap::new();
        if !settings.api_key.trim().is_empty() {
            let auth = format!("Bearer {}", settings.api_key.trim());
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth)
                    .map_err(|_| config_error("invalid detector API key".into()))?,
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(settings.timeout)
            .default_headers(headers)
            .build()
            .map_err(|err| config_error(format!("failed to build detector HTTP client: {err}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", settings.base_url.trim_end_matches('/')),
            model: settings.model,
            max_tokens: settings.max_tokens,
        })
    }
}

#[async_trait]
impl RegionDetector for HttpRegionDetector {
    async fn describe(&self, image_data_uri: &str, instruction: &str) -> Result<String, PipelineError> {
        let request = ChatRequest {
            model: &self.model,
            temperature: 0.0,
            max_tokens: self.max_tokens,
            messages: vec![ChatMessage {
                role: "user",
                content: vec![
                    ContentPart::Text { text: instruction },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl { url: image_data_uri },
                    },
                ],
            }],
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|err| PipelineError::DetectionService(UpstreamFailure::unreachable(err.to_string())))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<body unavailable>".to_string());
        if !status.is_success() {
            return Err(PipelineError::DetectionService(UpstreamFailure::new(
                Some(status.as_u16()),
                body,
            )));
        }

        let malformed = |reason: &str| {
            PipelineError::DetectionService(UpstreamFailure::new(
                Some(status.as_u16()),
                format!("{reason}: {body}"),
            ))
        };
        let envelope: ChatResponse =
            serde_json::from_str(&body).map_err(|_| malformed("response is not valid JSON"))?;
        envelope
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .and_then(content_text)
            .ok_or_else(|| malformed("response is missing choices[0].message.content"))
    }
}

/// Content is usually a string; some gateways return an array of text parts.
fn content_text(content: Value) -> Option<String> {
    match content {
        Value::String(text) => Some(text),
        Value::Array(parts) => {
            let text: String = parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect();
            (!text.is_empty()).then_some(text)
        }
        _ => None,
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: u32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: Vec<ContentPart<'a>>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl<'a> },
}

#[derive(Serialize)]
struct ImageUrl<'a> {
    url: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<Value>,
}
