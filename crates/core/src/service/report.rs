//! Batch and job reports.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::converter::{CompletionSignal, ConversionResult, Recovery, StageCode};
use crate::metadata::ImageRecord;

/// A successfully converted image.
#[derive(Debug, Clone, Serialize)]
pub struct ConvertedItem {
    pub name: String,
    pub original_path: String,
    pub converted_path: String,
    pub size_bytes: u64,
    pub quality: u8,
    pub encode_attempts: u32,
    pub duration_ms: u64,
}

/// An image that failed, with what the failure left behind.
#[derive(Debug, Clone, Serialize)]
pub struct FailedItem {
    pub name: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageCode>,
    pub kind: &'static str,
    pub recovery: Recovery,
    pub error: String,
}

/// Outcome of one batch.
///
/// A completed batch may still contain failures; `completed` only says the
/// pool finished every task.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: u64,
    /// Images handed to the converter.
    pub submitted: usize,
    pub succeeded: Vec<ConvertedItem>,
    pub failed: Vec<FailedItem>,
    /// Paths that never made it into the queue.
    pub rejected: Vec<String>,
    /// Metadata records written.
    pub persisted: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist_error: Option<String>,
    /// The completion signal was received and reported success.
    pub completed: bool,
    /// The consumer stopped waiting before the batch finished.
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip)]
    pub(crate) records: Vec<ImageRecord>,
}

impl BatchReport {
    pub(crate) fn new(batch_id: u64, submitted: usize) -> Self {
        Self {
            batch_id,
            submitted,
            succeeded: Vec::new(),
            failed: Vec::new(),
            rejected: Vec::new(),
            persisted: 0,
            persist_error: None,
            completed: false,
            cancelled: false,
            message: None,
            records: Vec::new(),
        }
    }

    /// Results received so far.
    pub fn received(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    /// Completed with no failures or rejections.
    pub fn is_clean(&self) -> bool {
        self.completed && self.failed.is_empty() && self.rejected.is_empty()
    }

    pub(crate) fn record(&mut self, result: &ConversionResult) {
        match (&result.converted, &result.error) {
            (Some(converted), _) => {
                if let Some(record) = ImageRecord::from_result(result, Utc::now()) {
                    self.records.push(record);
                }
                self.succeeded.push(ConvertedItem {
                    name: result.image.name.clone(),
                    original_path: result.image.path.clone(),
                    converted_path: converted.path.clone(),
                    size_bytes: converted.size_bytes,
                    quality: converted.quality,
                    encode_attempts: converted.encode_attempts,
                    duration_ms: result.duration_ms,
                });
            }
            (None, error) => self.failed.push(FailedItem {
                name: result.image.name.clone(),
                path: result.image.path.clone(),
                stage: error.as_ref().and_then(|e| e.stage()),
                kind: error.as_ref().map_or("unknown", |e| e.kind()),
                recovery: error
                    .as_ref()
                    .map_or(Recovery::NeedsReconciliation, |e| e.recovery()),
                error: error
                    .as_ref()
                    .map_or_else(|| "unknown error".to_string(), |e| e.to_string()),
            }),
        }
    }

    pub(crate) fn complete(&mut self, signal: &CompletionSignal) {
        self.completed = signal.success;
        self.message = Some(signal.message.clone());
    }
}

/// Outcome of a conversion job, which may span several batches.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Images the job set out to convert.
    pub total: usize,
    pub batches: Vec<BatchReport>,
    /// Why the job stopped early, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobReport {
    pub(crate) fn new(total: usize) -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            total,
            batches: Vec::new(),
            error: None,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.batches.iter().map(|b| b.succeeded.len()).sum()
    }

    pub fn failed(&self) -> usize {
        self.batches.iter().map(|b| b.failed.len()).sum()
    }

    pub fn rejected(&self) -> usize {
        self.batches.iter().map(|b| b.rejected.len()).sum()
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}
