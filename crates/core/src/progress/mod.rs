//! Live progress fan-out.
//!
//! A [`ProgressTracker`] is notified of every per-item outcome and forwards
//! it to any number of registered observers (for example, WebSocket
//! clients). Each observer owns a small bounded queue; an observer that
//! stops draining it is dropped rather than slowing down the workers.

mod tracker;
mod types;

pub use tracker::ProgressTracker;
pub use types::{ItemOutcome, ProgressEvent, ProgressSnapshot};
