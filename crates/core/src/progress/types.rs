//! Progress event types.

use serde::Serialize;

use crate::converter::ConversionResult;

/// What the tracker needs to know about one finished task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemOutcome {
    pub batch_id: u64,
    pub name: String,
    pub path: String,
    /// Where the converted object was stored, on success.
    pub converted_path: Option<String>,
    /// Error message, on failure.
    pub error: Option<String>,
}

impl From<&ConversionResult> for ItemOutcome {
    fn from(result: &ConversionResult) -> Self {
        Self {
            batch_id: result.batch_id,
            name: result.image.name.clone(),
            path: result.image.path.clone(),
            converted_path: result.converted.as_ref().map(|c| c.path.clone()),
            error: result.error.as_ref().map(|e| e.to_string()),
        }
    }
}

/// Event delivered to each observer.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub batch_id: u64,
    pub name: String,
    pub path: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub converted_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Counters as of this event.
    pub progress: ProgressSnapshot,
}

/// Running counters. Fields are read independently, so a snapshot taken
/// while updates are in flight may be off by one between fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl ProgressSnapshot {
    /// Items finished so far.
    pub fn completed(&self) -> usize {
        self.succeeded + self.failed
    }
}
