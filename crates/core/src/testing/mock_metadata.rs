//! Mock metadata store for testing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::metadata::{ImageRecord, MetadataError, MetadataStore};

/// In-memory implementation of [`MetadataStore`].
#[derive(Debug, Clone, Default)]
pub struct MockMetadataStore {
    records: Arc<Mutex<Vec<ImageRecord>>>,
    batches: Arc<Mutex<Vec<usize>>>,
    fail: Arc<AtomicBool>,
}

impl MockMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, Vec<ImageRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every subsequent save fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// All stored records, in insertion order.
    pub fn saved(&self) -> Vec<ImageRecord> {
        self.records().clone()
    }

    /// Sizes of the batches passed to `save_batch`.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl MetadataStore for MockMetadataStore {
    fn save_batch(&self, records: &[ImageRecord]) -> Result<usize, MetadataError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(MetadataError::Database("injected failure".to_string()));
        }
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(records.len());

        let mut stored = self.records();
        for record in records {
            stored.retain(|r| r.converted_path != record.converted_path);
            stored.push(record.clone());
        }
        Ok(records.len())
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<ImageRecord>, MetadataError> {
        let mut records = self.records().clone();
        records.sort_by(|a, b| b.converted_at.cmp(&a.converted_at));
        records.truncate(limit);
        Ok(records)
    }

    fn find_by_original(&self, original_path: &str) -> Result<Option<ImageRecord>, MetadataError> {
        Ok(self
            .records()
            .iter()
            .rev()
            .find(|r| r.original_path == original_path)
            .cloned())
    }

    fn count(&self) -> Result<u64, MetadataError> {
        Ok(self.records().len() as u64)
    }
}
