// THEORY:
// The detector is a vision-language model asked to answer in strict JSON. It
// frequently doesn't: answers arrive wrapped in Markdown fences, preceded by a
// sentence of prose, or with the occasional malformed element. This module
// recovers a clean `Vec<Detection>` from that text in three independent phases:
//
// 1.  **Fence stripping**: remove every Markdown code-fence marker together with
//     its language tag (```json, ```JSON, bare ```).
// 2.  **Array extraction**: take the span from the first `[` to the last `]`
//     (a greedy bracket match). If that span does not parse, fall back to the
//     first balanced top-level array, which rescues answers that trail off
//     into prose containing stray brackets.
// 3.  **JSON parsing**: parse the span as an array. Elements that are not a
//     `{label, bbox}` object are skipped with a warning rather than failing the
//     whole answer.
//
// Each phase is a plain function so it can be tested without the network.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::PipelineError;

/// Upper bound of the normalized coordinate space.
pub const COORDINATE_SCALE: f64 = 1000.0;

/// Accepted label keys, highest priority first.
const LABEL_KEYS: [&str; 3] = ["label", "name", "object_label"];
/// Accepted box keys, highest priority first.
const BBOX_KEYS: [&str; 4] = ["bbox", "bbox_2d", "box_2d", "box"];

/// A labeled candidate box in thousandths of the image width (x) and height (y).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub label: String,
    /// `[x1, y1, x2, y2]`, not yet clamped.
    pub bbox: [f64; 4],
}

impl Detection {
    pub fn new(label: impl Into<String>, bbox: [f64; 4]) -> Self {
        Self {
            label: label.into(),
            bbox,
        }
    }

    /// Reads one detector element. Models drift between key names and sometimes
    /// send several at once, so the first usable key in priority order wins.
    pub fn from_value(element: &Value) -> Result<Self, String> {
        let object = element
            .as_object()
            .ok_or_else(|| format!("expected an object, got {element}"))?;
        let label = first_usable(object, &LABEL_KEYS, |value| {
            value
                .as_str()
                .map(str::trim)
                .filter(|label| !label.is_empty())
                .map(str::to_string)
        })
        .ok_or("missing label")?;
        let bbox = first_usable(object, &BBOX_KEYS, as_box).ok_or("missing or malformed bbox")?;
        Ok(Self { label, bbox })
    }
}

fn first_usable<T>(
    object: &Map<String, Value>,
    keys: &[&str],
    read: impl Fn(&Value) -> Option<T>,
) -> Option<T> {
    keys.iter().find_map(|key| object.get(*key).and_then(&read))
}

fn as_box(value: &Value) -> Option<[f64; 4]> {
    match value.as_array()?.as_slice() {
        [x1, y1, x2, y2] => Some([x1.as_f64()?, y1.as_f64()?, x2.as_f64()?, y2.as_f64()?]),
        _ => None,
    }
}

/// Phase 1: removes Markdown code-fence markers and their language tags.
pub fn strip_code_fences(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find("```") {
        out.push_str(&rest[..pos]);
        rest = &rest[pos + 3..];
        let tag_len = rest
            .find(|c: char| !c.is_ascii_alphanumeric())
            .unwrap_or(rest.len());
        rest = &rest[tag_len..];
    }
    out.push_str(rest);
    out
}

/// Phase 2 (greedy): the span from the first `[` to the last `]`, inclusive.
pub fn extract_array_span(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    (end > start).then(|| &text[start..=end])
}

/// Phase 2 (fallback): the first balanced top-level array, string-literal aware.
pub fn extract_balanced_array(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Phase 3: parses an array span into detections, skipping malformed elements.
pub fn parse_detection_array(span: &str) -> Result<Vec<Detection>, serde_json::Error> {
    let elements: Vec<Value> = serde_json::from_str(span)?;
    let total = elements.len();

    let detections: Vec<Detection> = elements
        .into_iter()
        .enumerate()
        .filter_map(|(index, element)| match Detection::from_value(&element) {
            Ok(detection) => Some(detection),
            Err(err) => {
                tracing::warn!(index, error = %err, "skipping malformed detection entry");
                None
            }
        })
        .collect();

    if detections.len() < total {
        tracing::debug!(kept = detections.len(), total, "dropped malformed detections");
    }
    Ok(detections)
}

/// Runs all three phases over a raw detector answer.
pub fn parse_detections(raw: &str) -> Result<Vec<Detection>, PipelineError> {
    let cleaned = strip_code_fences(raw);

    let greedy = extract_array_span(&cleaned).ok_or_else(|| {
        PipelineError::DetectionFormat(format!("no JSON array found in: {}", preview(raw)))
    })?;

    match parse_detection_array(greedy) {
        Ok(detections) => Ok(detections),
        Err(greedy_err) => {
            let balanced = extract_balanced_array(&cleaned).filter(|span| *span != greedy);
            match balanced.map(parse_detection_array) {
                Some(Ok(detections)) => Ok(detections),
                _ => Err(PipelineError::DetectionFormat(format!(
                    "{greedy_err} in: {}",
                    preview(raw)
                ))),
            }
        }
    }
}

fn preview(text: &str) -> String {
    const MAX: usize = 200;
    let trimmed = text.trim();
    match trimmed.char_indices().nth(MAX) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}
