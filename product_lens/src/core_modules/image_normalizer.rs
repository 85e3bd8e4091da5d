// THEORY:
// The `ImageNormalizer` is the entry stage of the search pipeline. It turns the
// caller's payload into a bounded working bitmap that every later stage shares.
//
// Key architectural principles:
// 1.  **Consume, don't borrow**: `normalize` takes the `RawImage` by value. The
//     encoded payload, its decoded bytes and the full-resolution bitmap all die
//     inside this function, so peak memory per invocation is bounded by the
//     working copy rather than by whatever the client uploaded.
// 2.  **Bounded working size**: the longer side is capped (800 px by default) with
//     the aspect ratio preserved. Images already inside the cap are left alone.
// 3.  **Uniform color model**: the working copy is always 8-bit RGB, which is what
//     the JPEG re-encodes further down the pipeline need.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use image::DynamicImage;
use image::imageops::FilterType;

use crate::core_modules::utils::image_helper::image_helper;
use crate::error::PipelineError;

/// The image exactly as the client supplied it.
#[derive(Clone)]
pub enum RawImage {
    /// Base64 text, optionally prefixed with a `data:<mime>;base64,` scheme.
    Base64(String),
    /// Already-decoded container bytes (JPEG, PNG, WebP, ...).
    Bytes(Vec<u8>),
}

impl RawImage {
    pub fn from_base64(payload: impl Into<String>) -> Self {
        RawImage::Base64(payload.into())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            RawImage::Base64(text) => image_helper::strip_data_uri_prefix(text).is_empty(),
            RawImage::Bytes(bytes) => bytes.is_empty(),
        }
    }

    fn into_bytes(self) -> Result<Vec<u8>, PipelineError> {
        match self {
            RawImage::Bytes(bytes) => Ok(bytes),
            RawImage::Base64(text) => {
                let payload: String = image_helper::strip_data_uri_prefix(&text)
                    .chars()
                    .filter(|c| !c.is_ascii_whitespace())
                    .collect();
                STANDARD
                    .decode(&payload)
                    .or_else(|_| STANDARD_NO_PAD.decode(&payload))
                    .map_err(|err| PipelineError::Decode(format!("invalid base64 payload: {err}")))
            }
        }
    }
}

impl std::fmt::Debug for RawImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RawImage::Base64(text) => write!(f, "RawImage::Base64({} chars)", text.len()),
            RawImage::Bytes(bytes) => write!(f, "RawImage::Bytes({} bytes)", bytes.len()),
        }
    }
}

/// The bounded RGB working copy shared by detection and cropping.
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    image: DynamicImage,
}

impl NormalizedImage {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn as_dynamic(&self) -> &DynamicImage {
        &self.image
    }

    /// Re-encodes the working copy as a JPEG data URI for upstream services.
    pub fn to_jpeg_data_uri(&self, quality: u8) -> Result<String, PipelineError> {
        let bytes = image_helper::encode_jpeg(&self.image, quality)
            .map_err(|err| PipelineError::Worker(format!("jpeg encode failed: {err}")))?;
        Ok(image_helper::to_data_uri(&bytes, image_helper::JPEG_MIME))
    }
}

impl From<DynamicImage> for NormalizedImage {
    fn from(image: DynamicImage) -> Self {
        Self {
            image: DynamicImage::ImageRgb8(image.to_rgb8()),
        }
    }
}

/// Target dimensions that fit `max_dimension` on the longer side, aspect preserved.
pub fn bounded_dimensions(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    let longer = width.max(height);
    if longer <= max_dimension || longer == 0 {
        return (width, height);
    }
    let scale = max_dimension as f64 / longer as f64;
    let scaled = |side: u32| ((side as f64 * scale).round() as u32).clamp(1, max_dimension);
    if width >= height {
        (max_dimension, scaled(height))
    } else {
        (scaled(width), max_dimension)
    }
}

/// Decodes a raw payload into a bounded `NormalizedImage`.
pub fn normalize(raw: RawImage, max_dimension: u32) -> Result<NormalizedImage, PipelineError> {
    if raw.is_empty() {
        return Err(PipelineError::InvalidInput("image payload is empty".into()));
    }

    let bytes = raw.into_bytes()?;
    let decoded = image::load_from_memory(&bytes)
        .map_err(|err| PipelineError::Decode(err.to_string()))?;
    drop(bytes);

    let (width, height) = (decoded.width(), decoded.height());
    let (target_width, target_height) = bounded_dimensions(width, height, max_dimension);
    if (target_width, target_height) == (width, height) {
        return Ok(NormalizedImage::from(decoded));
    }

    tracing::debug!(width, height, target_width, target_height, "downscaling input image");
    let resized = decoded.resize_exact(target_width, target_height, FilterType::Triangle);
    Ok(NormalizedImage::from(resized))
}
