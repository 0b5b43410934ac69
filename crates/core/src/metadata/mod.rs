//! Persistence of converted image metadata.
//!
//! After a batch completes, the service layer stores one [`ImageRecord`]
//! per successfully converted image. Failures are not persisted; they are
//! reported to the caller instead.

mod sqlite;
mod store;

pub use sqlite::SqliteMetadataStore;
pub use store::{ImageRecord, MetadataError, MetadataStore};
