//! Error types for the service module.

use thiserror::Error;

use crate::converter::SubmitError;
use crate::storage::StorageError;

/// Errors returned by [`ConversionService`](super::ConversionService).
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Another conversion job holds the service.
    #[error("A conversion job is already running")]
    JobInProgress,

    /// The converter rejected the batch.
    #[error(transparent)]
    Submit(#[from] SubmitError),

    /// Listing the source objects failed.
    #[error("Failed to list images: {0}")]
    Storage(#[from] StorageError),
}

impl ServiceError {
    /// Whether the request conflicts with work already in flight.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::JobInProgress | Self::Submit(SubmitError::Busy { .. })
        )
    }

    /// Whether the converter cannot take work right now for capacity or
    /// lifecycle reasons.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Submit(SubmitError::ConverterClosed | SubmitError::QueueFull { .. })
        )
    }
}
