//! Object storage abstraction.
//!
//! Blobs are addressed by slash-separated relative paths such as
//! `posts/2024/cover.jpg`. Every operation is individually fallible and no
//! multi-object transactions are offered, so callers that write a new object
//! and then delete an old one must cope with the window in between.

mod error;
mod fs_store;
mod traits;

pub use error::StorageError;
pub use fs_store::FsObjectStore;
pub use traits::ObjectStore;
