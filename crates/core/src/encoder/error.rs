//! Error types for the encoder module.

use thiserror::Error;

/// Errors that can occur while re-encoding an image.
#[derive(Debug, Clone, Error)]
pub enum EncoderError {
    /// Input bytes could not be decoded as an image.
    #[error("Failed to decode image: {reason}")]
    Decode { reason: String },

    /// Encoding to the target format failed.
    #[error("Failed to encode image: {reason}")]
    Encode { reason: String },

    /// Quality outside 1..=100.
    #[error("Invalid quality {quality}, expected 1..=100")]
    InvalidQuality { quality: u8 },
}

impl EncoderError {
    /// Creates a new decode error.
    pub fn decode(reason: impl Into<String>) -> Self {
        Self::Decode {
            reason: reason.into(),
        }
    }

    /// Creates a new encode error.
    pub fn encode(reason: impl Into<String>) -> Self {
        Self::Encode {
            reason: reason.into(),
        }
    }
}
