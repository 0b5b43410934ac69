//! Trait definitions for the encoder module.

use super::error::EncoderError;

/// Re-encodes raw image bytes into the encoder's target format.
pub trait ImageEncoder: Send + Sync {
    /// Returns the name of this encoder implementation.
    fn name(&self) -> &str;

    /// File extension of the produced format, without the dot.
    fn target_extension(&self) -> &str;

    /// Re-encodes `input` at `quality` (1..=100).
    fn encode(&self, input: &[u8], quality: u8) -> Result<Vec<u8>, EncoderError>;

    /// Re-encodes a previous output that came out too large. Encoders that
    /// cannot trade quality for size any other way may shrink the image here.
    fn reencode(&self, input: &[u8], quality: u8) -> Result<Vec<u8>, EncoderError> {
        self.encode(input, quality)
    }

    /// Returns the supported input formats.
    fn supported_input_formats(&self) -> &[&str] {
        &["jpg", "jpeg", "png", "gif", "bmp", "tif", "tiff", "webp"]
    }

    /// Whether an object with this extension can be fed to the encoder.
    fn accepts(&self, extension: &str) -> bool {
        let extension = extension.to_ascii_lowercase();
        self.supported_input_formats()
            .iter()
            .any(|f| *f == extension)
    }
}
