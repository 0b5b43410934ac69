//! Metadata storage trait and types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::converter::ConversionResult;

/// Errors from metadata persistence.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// Database error.
    #[error("Database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for MetadataError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// Durable record of one converted image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Batch that produced the conversion.
    pub batch_id: u64,
    /// File name of the original object.
    pub name: String,
    /// Path of the original object (deleted unless in-place).
    pub original_path: String,
    /// Path of the converted object.
    pub converted_path: String,
    /// Format of the original object.
    pub format: String,
    /// Size of the converted object.
    pub size_bytes: u64,
    /// SHA-256 of the converted object, hex encoded.
    pub checksum: String,
    pub converted_at: DateTime<Utc>,
}

impl ImageRecord {
    /// Build a record from a successful result. Returns `None` for failures.
    pub fn from_result(result: &ConversionResult, converted_at: DateTime<Utc>) -> Option<Self> {
        let converted = result.converted.as_ref()?;
        Some(Self {
            batch_id: result.batch_id,
            name: result.image.name.clone(),
            original_path: result.image.path.clone(),
            converted_path: converted.path.clone(),
            format: result.image.format.clone(),
            size_bytes: converted.size_bytes,
            checksum: converted.checksum.clone(),
            converted_at,
        })
    }
}

/// Durable store for image records.
///
/// Implementations are synchronous; callers on the async runtime should
/// expect a short blocking write per batch.
pub trait MetadataStore: Send + Sync {
    /// Store all `records` atomically. Records for an already known
    /// converted path replace the earlier record. Returns the number stored.
    fn save_batch(&self, records: &[ImageRecord]) -> Result<usize, MetadataError>;

    /// Most recently converted records first.
    fn list_recent(&self, limit: usize) -> Result<Vec<ImageRecord>, MetadataError>;

    /// Look up the record for an original path.
    fn find_by_original(&self, original_path: &str) -> Result<Option<ImageRecord>, MetadataError>;

    /// Total number of records.
    fn count(&self) -> Result<u64, MetadataError>;
}
