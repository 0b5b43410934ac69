//! Testing utilities and mock implementations.
//!
//! This module provides in-memory implementations of the collaborator
//! traits, allowing the whole conversion pipeline to be exercised without a
//! filesystem, a real codec or a database.
//!
//! # Example
//!
//! ```rust,ignore
//! use imgpress_core::testing::{fixtures, MockEncoder, MockObjectStore};
//!
//! let store = MockObjectStore::new();
//! store.insert("posts/a.jpg", fixtures::image_bytes(100)).await;
//! store.fail_delete("posts/a.jpg").await;
//!
//! let encoder = MockEncoder::new().panic_on(b"PANIC");
//! ```

mod mock_encoder;
mod mock_metadata;
mod mock_store;

pub use mock_encoder::MockEncoder;
pub use mock_metadata::MockMetadataStore;
pub use mock_store::{MockObjectStore, StorageOp};

/// Test fixtures and helper functions.
pub mod fixtures {
    use crate::converter::ImageDescriptor;

    /// Descriptor for an image stored at `path`.
    pub fn image(path: &str) -> ImageDescriptor {
        ImageDescriptor::from_path(path)
    }

    /// Descriptors for several paths.
    pub fn images(paths: &[&str]) -> Vec<ImageDescriptor> {
        paths.iter().map(|p| image(p)).collect()
    }

    /// Opaque image payload of `len` bytes.
    pub fn image_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| b'a' + (i % 26) as u8).collect()
    }

    /// Payload that starts with `marker`, padded to at least `len` bytes.
    /// Use with [`MockEncoder::fail_on`](super::MockEncoder::fail_on) and friends.
    pub fn marked_bytes(marker: &[u8], len: usize) -> Vec<u8> {
        let mut bytes = marker.to_vec();
        if bytes.len() < len {
            bytes.resize(len, b'.');
        }
        bytes
    }
}
