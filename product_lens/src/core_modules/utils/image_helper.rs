pub mod image_helper {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use image::codecs::jpeg::JpegEncoder;
    use image::{DynamicImage, ImageEncoder};

    pub const JPEG_MIME: &str = "image/jpeg";

    /// Encodes an image as baseline JPEG. Alpha is dropped since JPEG has none.
    pub fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, image::error::ImageError> {
        let rgb = image.to_rgb8();
        let mut buffer = Vec::with_capacity((rgb.width() * rgb.height()) as usize / 4);
        let encoder = JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100));

        encoder.write_image(
            rgb.as_raw(),
            rgb.width(),
            rgb.height(),
            image::ExtendedColorType::Rgb8,
        )?;

        Ok(buffer)
    }

    /// Wraps encoded bytes in a `data:` URI.
    pub fn to_data_uri(bytes: &[u8], mime: &str) -> String {
        format!("data:{mime};base64,{}", STANDARD.encode(bytes))
    }

    /// Returns the base64 payload of a possibly data-URI prefixed string.
    pub fn strip_data_uri_prefix(input: &str) -> &str {
        let trimmed = input.trim();
        if trimmed.starts_with("data:") {
            if let Some((_, payload)) = trimmed.split_once(',') {
                return payload;
            }
        }
        trimmed
    }
}
