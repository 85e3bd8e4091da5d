// THEORY:
// The `RegionCropper` converts the detector's resolution-independent boxes into
// independent JPEG crops of the working image.
//
// Key architectural principles:
// 1.  **Cost bound first**: only the first `max_regions` detections are
//     considered; everything after that is ignored before any pixel work.
// 2.  **Coordinate transform**: a coordinate `t` in thousandths maps to
//     `round(t / 1000 * dimension)` pixels. Boxes are clamped to the normalized
//     space, then to the image bounds, so a crop never leaves the bitmap.
// 3.  **Silent geometric filtering**: inverted boxes and crops narrower or
//     shorter than `min_crop_px` are dropped, not reported as errors. Only an
//     empty result is fatal, because nothing downstream can run without a region.
// 4.  **Owned input**: `crop_regions` consumes the `NormalizedImage`. When it
//     returns, the working bitmap is gone and only the compact crops remain.

use crate::core_modules::detection::{COORDINATE_SCALE, Detection};
use crate::core_modules::image_normalizer::NormalizedImage;
use crate::core_modules::utils::image_helper::image_helper;
use crate::error::PipelineError;

/// A crop rectangle in pixel coordinates of the working image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelBox {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

/// One independently encoded product candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct CropRegion {
    pub label: String,
    pub bounds: PixelBox,
    /// JPEG bytes of the crop.
    pub image_bytes: Vec<u8>,
}

impl CropRegion {
    pub fn to_data_uri(&self) -> String {
        image_helper::to_data_uri(&self.image_bytes, image_helper::JPEG_MIME)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CropSettings {
    pub max_regions: usize,
    pub min_crop_px: u32,
    pub jpeg_quality: u8,
}

/// Maps a thousandths box onto a `width` x `height` image.
///
/// Returns `None` for boxes that are inverted, non-finite, or smaller than
/// `min_crop_px` on either side once clamped.
pub fn pixel_box(bbox: &[f64; 4], width: u32, height: u32, min_crop_px: u32) -> Option<PixelBox> {
    if bbox.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let [x1, y1, x2, y2] = bbox.map(|v| v.clamp(0.0, COORDINATE_SCALE));
    if x1 >= x2 || y1 >= y2 {
        return None;
    }

    let to_pixels = |t: f64, dimension: u32| (t / COORDINATE_SCALE * dimension as f64).round() as i64;
    let left = to_pixels(x1, width).max(0);
    let top = to_pixels(y1, height).max(0);
    let right = to_pixels(x2, width).min(width as i64);
    let bottom = to_pixels(y2, height).min(height as i64);

    let crop_width = right - left;
    let crop_height = bottom - top;
    let minimum = (min_crop_px as i64).max(1);
    if crop_width < minimum || crop_height < minimum {
        return None;
    }

    Some(PixelBox {
        left: left as u32,
        top: top as u32,
        width: crop_width as u32,
        height: crop_height as u32,
    })
}

/// Crops and encodes up to `max_regions` detections, preserving detection order.
pub fn crop_regions(
    image: NormalizedImage,
    detections: Vec<Detection>,
    settings: CropSettings,
) -> Result<Vec<CropRegion>, PipelineError> {
    let (width, height) = (image.width(), image.height());
    let considered = detections.len().min(settings.max_regions);
    if detections.len() > considered {
        tracing::debug!(
            detected = detections.len(),
            kept = considered,
            "truncating detections to region cap"
        );
    }

    let mut regions = Vec::with_capacity(considered);
    for detection in detections.into_iter().take(settings.max_regions) {
        let Some(bounds) = pixel_box(&detection.bbox, width, height, settings.min_crop_px) else {
            tracing::warn!(
                label = %detection.label,
                bbox = ?detection.bbox,
                "dropping degenerate region"
            );
            continue;
        };

        let crop = image
            .as_dynamic()
            .crop_imm(bounds.left, bounds.top, bounds.width, bounds.height);
        let image_bytes = image_helper::encode_jpeg(&crop, settings.jpeg_quality)
            .map_err(|err| PipelineError::Worker(format!("crop encode failed: {err}")))?;

        regions.push(CropRegion {
            label: detection.label,
            bounds,
            image_bytes,
        });
    }

    if regions.is_empty() {
        return Err(PipelineError::NoRegions);
    }
    Ok(regions)
}
