//! Image encoder module.
//!
//! The encoder is the black-box primitive of the pipeline: raw image bytes
//! plus a quality setting in, re-encoded bytes out. It is synchronous and
//! CPU-bound; the converter runs it on the blocking thread pool.

mod error;
mod traits;
mod webp;

pub use error::EncoderError;
pub use traits::ImageEncoder;
pub use webp::WebpEncoder;
