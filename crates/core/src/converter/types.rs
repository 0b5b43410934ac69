//! Types for the converter module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::error::StageError;

/// An image stored in the object store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageDescriptor {
    /// Display name, usually the file name.
    pub name: String,
    /// Current object path, e.g. `posts/2024/cover.jpg`.
    pub path: String,
    /// Source format: lowercase extension without the dot.
    pub format: String,
}

impl ImageDescriptor {
    /// Builds a descriptor from an object path.
    pub fn from_path(path: impl Into<String>) -> Self {
        let path = path.into();
        let name = path.rsplit('/').next().unwrap_or(&path).to_string();
        let format = match name.rfind('.') {
            Some(idx) if idx > 0 => name[idx + 1..].to_ascii_lowercase(),
            _ => String::new(),
        };
        Self { name, path, format }
    }

    /// Path the converted object is stored at: the source path with its
    /// extension replaced by `extension`.
    pub fn target_path(&self, extension: &str) -> String {
        let file_start = self.path.rfind('/').map(|idx| idx + 1).unwrap_or(0);
        let stem_end = match self.path[file_start..].rfind('.') {
            Some(idx) if idx > 0 => file_start + idx,
            _ => self.path.len(),
        };
        format!("{}.{}", &self.path[..stem_end], extension)
    }
}

/// Handle for an accepted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchHandle {
    /// Batch id; 0 for the empty batch.
    pub id: u64,
    /// Number of tasks in the batch.
    pub size: usize,
}

impl BatchHandle {
    pub(crate) fn empty() -> Self {
        Self { id: 0, size: 0 }
    }

    /// Whether nothing was submitted.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// One image's conversion work item. Consumed exactly once by one worker.
#[derive(Debug, Clone)]
pub struct ImageTask {
    /// Batch this task belongs to.
    pub batch_id: u64,
    /// The image to convert.
    pub image: ImageDescriptor,
    /// Batch-level cancellation scope.
    pub scope: CancellationToken,
}

/// The object a successful task produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConvertedImage {
    /// Path of the new object.
    pub path: String,
    /// Size of the new object.
    pub size_bytes: u64,
    /// Hex SHA-256 of the new object.
    pub checksum: String,
    /// Quality of the final encode pass.
    pub quality: u8,
    /// Number of encode passes.
    pub encode_attempts: u32,
}

/// Outcome of one task, published to the output queue.
#[derive(Debug, Clone)]
pub struct ConversionResult {
    /// Batch the task belonged to.
    pub batch_id: u64,
    /// The original image.
    pub image: ImageDescriptor,
    /// Whether all four stages succeeded.
    pub success: bool,
    /// Set when `success` is true.
    pub converted: Option<ConvertedImage>,
    /// Set when `success` is false.
    pub error: Option<StageError>,
    /// Wall time spent on the task.
    pub duration_ms: u64,
}

impl ConversionResult {
    pub(crate) fn new(
        batch_id: u64,
        image: ImageDescriptor,
        outcome: Result<ConvertedImage, StageError>,
        duration_ms: u64,
    ) -> Self {
        match outcome {
            Ok(converted) => Self {
                batch_id,
                image,
                success: true,
                converted: Some(converted),
                error: None,
                duration_ms,
            },
            Err(error) => Self {
                batch_id,
                image,
                success: false,
                converted: None,
                error: Some(error),
                duration_ms,
            },
        }
    }
}

/// Emitted once when a batch's outstanding-task counter reaches zero.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionSignal {
    /// Batch that completed.
    pub batch_id: u64,
    /// True when the batch ran to completion. Per-item failures do not clear it.
    pub success: bool,
    /// Human readable summary.
    pub message: String,
    /// Tasks that succeeded.
    pub succeeded: usize,
    /// Tasks that failed.
    pub failed: usize,
    /// When the signal was emitted.
    pub timestamp: DateTime<Utc>,
}

/// Lifecycle state of the converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConverterState {
    Uninitialized,
    Running,
    ShuttingDown,
    Closed,
}

impl ConverterState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Self::Uninitialized => 0,
            Self::Running => 1,
            Self::ShuttingDown => 2,
            Self::Closed => 3,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::Running,
            2 => Self::ShuttingDown,
            _ => Self::Closed,
        }
    }
}

/// Point-in-time view of the converter.
#[derive(Debug, Clone, Serialize)]
pub struct ConverterStatus {
    pub state: ConverterState,
    /// Configured number of workers.
    pub workers: usize,
    /// Worker loops currently alive.
    pub active_workers: usize,
    pub queue_capacity: usize,
    /// Tasks waiting in the input queue.
    pub queued: usize,
    /// Tasks of the current batch not yet completed.
    pub outstanding: usize,
    /// Most recently accepted batch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_batch: Option<u64>,
    /// Tasks completed since startup.
    pub total_processed: u64,
    /// Tasks failed since startup.
    pub total_failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_from_path() {
        let image = ImageDescriptor::from_path("posts/2024/Cover.JPG");
        assert_eq!(image.name, "Cover.JPG");
        assert_eq!(image.format, "jpg");
        assert_eq!(image.path, "posts/2024/Cover.JPG");
    }

    #[test]
    fn test_descriptor_without_extension() {
        let image = ImageDescriptor::from_path("raw/blob");
        assert_eq!(image.name, "blob");
        assert_eq!(image.format, "");
    }

    #[test]
    fn test_target_path_replaces_extension() {
        let image = ImageDescriptor::from_path("posts/a.b/photo.jpeg");
        assert_eq!(image.target_path("webp"), "posts/a.b/photo.webp");
    }

    #[test]
    fn test_target_path_appends_without_extension() {
        assert_eq!(
            ImageDescriptor::from_path("posts.d/photo").target_path("webp"),
            "posts.d/photo.webp"
        );
        assert_eq!(
            ImageDescriptor::from_path(".hidden").target_path("webp"),
            ".hidden.webp"
        );
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            ConverterState::Uninitialized,
            ConverterState::Running,
            ConverterState::ShuttingDown,
            ConverterState::Closed,
        ] {
            assert_eq!(ConverterState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn test_completion_signal_serialization() {
        let signal = CompletionSignal {
            batch_id: 4,
            success: true,
            message: "done".to_string(),
            succeeded: 2,
            failed: 1,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&signal).unwrap();
        assert!(json.contains("\"batch_id\":4"));
        assert!(json.contains("\"failed\":1"));
    }
}
