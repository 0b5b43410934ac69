//! WebP encoder built on the `image` crate.

use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType};

use super::error::EncoderError;
use super::traits::ImageEncoder;

const FULL_RESOLUTION: u8 = 100;

/// Encodes images as lossless WebP.
///
/// The `image` crate only ships a lossless WebP encoder, so the first pass
/// keeps the source resolution whatever the quality. Only a re-encode of an
/// oversized output trades pixels for size: at quality `q` it keeps roughly
/// `q`% of the pixels it is given.
#[derive(Debug, Clone, Default)]
pub struct WebpEncoder {
    /// Longest edge allowed in the output; larger images are scaled down first.
    max_dimension: Option<u32>,
}

impl WebpEncoder {
    /// Creates a new encoder without a dimension cap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the longest output edge.
    pub fn with_max_dimension(mut self, max_dimension: u32) -> Self {
        self.max_dimension = Some(max_dimension.max(1));
        self
    }

    fn scaled_dimensions(&self, width: u32, height: u32, quality: u8) -> (u32, u32) {
        let mut factor = if quality >= FULL_RESOLUTION {
            1.0
        } else {
            (f64::from(quality) / 100.0).sqrt()
        };

        if let Some(max) = self.max_dimension {
            let longest = width.max(height);
            if longest > max {
                factor = factor.min(f64::from(max) / f64::from(longest));
            }
        }

        let scale = |edge: u32| ((f64::from(edge) * factor).round() as u32).max(1);
        (scale(width), scale(height))
    }

    fn resize(&self, image: DynamicImage, quality: u8) -> DynamicImage {
        let (width, height) = self.scaled_dimensions(image.width(), image.height(), quality);
        if (width, height) == (image.width(), image.height()) {
            image
        } else {
            image.resize_exact(width, height, FilterType::Triangle)
        }
    }

    /// Decodes `input`, scales it for `scale_quality` and writes lossless WebP.
    fn write(&self, input: &[u8], scale_quality: u8) -> Result<Vec<u8>, EncoderError> {
        let image =
            image::load_from_memory(input).map_err(|e| EncoderError::decode(e.to_string()))?;
        let rgba = self.resize(image, scale_quality).to_rgba8();

        let mut output = Vec::new();
        WebPEncoder::new_lossless(&mut output)
            .encode(
                rgba.as_raw(),
                rgba.width(),
                rgba.height(),
                ExtendedColorType::Rgba8,
            )
            .map_err(|e| EncoderError::encode(e.to_string()))?;

        Ok(output)
    }
}

impl ImageEncoder for WebpEncoder {
    fn name(&self) -> &str {
        "webp"
    }

    fn target_extension(&self) -> &str {
        "webp"
    }

    fn encode(&self, input: &[u8], quality: u8) -> Result<Vec<u8>, EncoderError> {
        validate_quality(quality)?;
        self.write(input, FULL_RESOLUTION)
    }

    fn reencode(&self, input: &[u8], quality: u8) -> Result<Vec<u8>, EncoderError> {
        validate_quality(quality)?;
        self.write(input, quality)
    }
}

fn validate_quality(quality: u8) -> Result<(), EncoderError> {
    if (1..=100).contains(&quality) {
        Ok(())
    } else {
        Err(EncoderError::InvalidQuality { quality })
    }
}
