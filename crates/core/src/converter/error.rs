//! Error types for the converter module.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Errors returned when a batch cannot be accepted.
///
/// These are local to the submitter; the pool never retries them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The input queue had no room. Tasks enqueued before the failure still run.
    #[error("Conversion queue is full ({enqueued} tasks of batch {batch_id} enqueued before rejection)")]
    QueueFull { batch_id: u64, enqueued: usize },

    /// The converter has been shut down (or never started).
    #[error("Converter is closed")]
    ConverterClosed,

    /// A previous batch still has outstanding tasks.
    #[error("A batch is already in flight ({outstanding} tasks outstanding)")]
    Busy { outstanding: usize },

    /// The submitter's cancellation scope fired during enqueue.
    #[error("Submission of batch {batch_id} cancelled after {enqueued} tasks were enqueued")]
    Cancelled { batch_id: u64, enqueued: usize },
}

impl SubmitError {
    /// Short label for metrics and API responses.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::QueueFull { .. } => "queue_full",
            Self::ConverterClosed => "closed",
            Self::Busy { .. } => "busy",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    /// Number of tasks that made it into the queue before the rejection.
    pub fn enqueued(&self) -> usize {
        match self {
            Self::QueueFull { enqueued, .. } | Self::Cancelled { enqueued, .. } => *enqueued,
            Self::ConverterClosed | Self::Busy { .. } => 0,
        }
    }

    /// Batch that was partially enqueued, if any task made it in.
    pub fn partial_batch(&self) -> Option<u64> {
        match self {
            Self::QueueFull { batch_id, enqueued } | Self::Cancelled { batch_id, enqueued }
                if *enqueued > 0 =>
            {
                Some(*batch_id)
            }
            _ => None,
        }
    }
}

/// Pipeline stage of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageCode {
    Download,
    Convert,
    Upload,
    Delete,
}

impl StageCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Convert => "convert",
            Self::Upload => "upload",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for StageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a failed task left behind in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recovery {
    /// Storage untouched; resubmitting is safe.
    NothingHappened,
    /// Original intact, no new object; resubmitting is safe.
    RetryableIntact,
    /// New object written but the original may still exist.
    NeedsReconciliation,
}

/// Per-task failure, tagged with the stage that failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// Fetching the original failed.
    #[error("Download of {path} failed: {reason}")]
    Download { path: String, reason: String },

    /// The encoder rejected the image.
    #[error("Conversion failed: {reason}")]
    Convert { reason: String },

    /// Re-encoding did not get under the size threshold.
    #[error(
        "Output still {size_bytes} bytes after {attempts} encode attempts (limit {limit_bytes})"
    )]
    SizeLimitExceeded {
        size_bytes: u64,
        limit_bytes: u64,
        attempts: u32,
    },

    /// Storing the converted object failed. The original is intact.
    #[error("Upload to {path} failed: {reason}")]
    Upload { path: String, reason: String },

    /// Removing the original failed after the converted object was stored.
    /// Both objects now exist.
    #[error("Deleting original {path} failed after upload to {converted_path}: {reason}")]
    Delete {
        path: String,
        converted_path: String,
        reason: String,
    },

    /// The task's scope was cancelled before `stage` started.
    #[error("Task cancelled before {stage} stage")]
    Cancelled { stage: StageCode },

    /// The task ran out of time during `stage`.
    #[error("Task timed out after {timeout_secs} seconds during {stage} stage")]
    Timeout { stage: StageCode, timeout_secs: u64 },

    /// The task panicked; storage state is unknown.
    #[error("Task panicked: {message}")]
    Panicked { message: String },
}

impl StageError {
    /// Stage the failure belongs to, if known.
    pub fn stage(&self) -> Option<StageCode> {
        match self {
            Self::Download { .. } => Some(StageCode::Download),
            Self::Convert { .. } | Self::SizeLimitExceeded { .. } => Some(StageCode::Convert),
            Self::Upload { .. } => Some(StageCode::Upload),
            Self::Delete { .. } => Some(StageCode::Delete),
            Self::Cancelled { stage } | Self::Timeout { stage, .. } => Some(*stage),
            Self::Panicked { .. } => None,
        }
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Download { .. } => "download",
            Self::Convert { .. } => "convert",
            Self::SizeLimitExceeded { .. } => "size_limit_exceeded",
            Self::Upload { .. } => "upload",
            Self::Delete { .. } => "delete",
            Self::Cancelled { .. } => "cancelled",
            Self::Timeout { .. } => "timeout",
            Self::Panicked { .. } => "panicked",
        }
    }

    /// Classifies what the failure left behind in storage.
    pub fn recovery(&self) -> Recovery {
        match self.stage() {
            Some(StageCode::Download) => Recovery::NothingHappened,
            Some(StageCode::Convert) | Some(StageCode::Upload) => Recovery::RetryableIntact,
            Some(StageCode::Delete) | None => Recovery::NeedsReconciliation,
        }
    }

    /// Whether the image can simply be resubmitted as a fresh task.
    pub fn is_retryable(&self) -> bool {
        self.recovery() != Recovery::NeedsReconciliation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_classification() {
        let download = StageError::Download {
            path: "a.jpg".to_string(),
            reason: "not found".to_string(),
        };
        assert_eq!(download.recovery(), Recovery::NothingHappened);

        let upload = StageError::Upload {
            path: "a.webp".to_string(),
            reason: "disk full".to_string(),
        };
        assert_eq!(upload.recovery(), Recovery::RetryableIntact);
        assert!(upload.is_retryable());

        let delete = StageError::Delete {
            path: "a.jpg".to_string(),
            converted_path: "a.webp".to_string(),
            reason: "permission denied".to_string(),
        };
        assert_eq!(delete.recovery(), Recovery::NeedsReconciliation);
        assert!(!delete.is_retryable());
    }

    #[test]
    fn test_size_limit_is_convert_stage() {
        let err = StageError::SizeLimitExceeded {
            size_bytes: 5000,
            limit_bytes: 1000,
            attempts: 5,
        };
        assert_eq!(err.stage(), Some(StageCode::Convert));
        assert_eq!(err.kind(), "size_limit_exceeded");
    }

    #[test]
    fn test_cancelled_before_delete_needs_reconciliation() {
        let err = StageError::Cancelled {
            stage: StageCode::Delete,
        };
        assert_eq!(err.recovery(), Recovery::NeedsReconciliation);
    }

    #[test]
    fn test_panicked_has_no_stage() {
        let err = StageError::Panicked {
            message: "boom".to_string(),
        };
        assert_eq!(err.stage(), None);
        assert_eq!(err.recovery(), Recovery::NeedsReconciliation);
    }

    #[test]
    fn test_submit_error_display() {
        let err = SubmitError::Busy { outstanding: 3 };
        assert_eq!(
            err.to_string(),
            "A batch is already in flight (3 tasks outstanding)"
        );
    }

    #[test]
    fn test_partial_batch_only_when_something_enqueued() {
        let partial = SubmitError::QueueFull {
            batch_id: 4,
            enqueued: 2,
        };
        let nothing = SubmitError::Cancelled {
            batch_id: 4,
            enqueued: 0,
        };

        assert_eq!(partial.partial_batch(), Some(4));
        assert_eq!(partial.enqueued(), 2);
        assert_eq!(nothing.partial_batch(), None);
        assert_eq!(SubmitError::ConverterClosed.partial_batch(), None);
    }
}
