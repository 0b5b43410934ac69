//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Converter (submissions, per-task outcomes, worker health)
//! - Progress fan-out (dropped observers)
//! - Metadata persistence

use once_cell::sync::Lazy;
use prometheus::{Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts};

// =============================================================================
// Converter - Submission Metrics
// =============================================================================

/// Batches accepted by the converter.
pub static BATCHES_SUBMITTED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "imgpress_batches_submitted_total",
        "Total batches accepted by the converter",
    )
    .unwrap()
});

/// Submissions rejected by reason.
pub static SUBMISSIONS_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "imgpress_submissions_rejected_total",
            "Total batch submissions rejected",
        ),
        &["reason"], // "queue_full", "closed", "busy", "cancelled"
    )
    .unwrap()
});

/// Tasks of the current batch not yet completed.
pub static OUTSTANDING_TASKS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "imgpress_outstanding_tasks",
        "Tasks of the in-flight batch not yet completed",
    )
    .unwrap()
});

// =============================================================================
// Converter - Task Metrics
// =============================================================================

/// Conversions total by result and failing stage.
pub static CONVERSIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("imgpress_conversions_total", "Total image conversions"),
        &["result", "error"], // result: "success", "failed"; error: kind or "none"
    )
    .unwrap()
});

/// Conversion duration in seconds.
pub static CONVERSION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "imgpress_conversion_duration_seconds",
            "Duration of image conversions",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]),
        &["result"],
    )
    .unwrap()
});

/// Encode passes needed per successful conversion.
pub static ENCODE_ATTEMPTS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "imgpress_encode_attempts",
            "Encode passes per successful conversion",
        )
        .buckets(vec![1.0, 2.0, 3.0, 5.0, 8.0]),
    )
    .unwrap()
});

/// Panics caught at the task boundary.
pub static TASK_PANICS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "imgpress_task_panics_total",
        "Total panics caught while processing a task",
    )
    .unwrap()
});

/// Workers respawned after their loop died.
pub static WORKER_REPLACEMENTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "imgpress_worker_replacements_total",
        "Total workers respawned after a crash",
    )
    .unwrap()
});

// =============================================================================
// Progress & Persistence Metrics
// =============================================================================

/// Progress observers dropped for not draining their queue.
pub static PROGRESS_OBSERVERS_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "imgpress_progress_observers_dropped_total",
        "Total progress observers dropped as unresponsive",
    )
    .unwrap()
});

/// Image records persisted by result.
pub static RECORDS_PERSISTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "imgpress_records_persisted_total",
            "Total image metadata records persisted",
        ),
        &["result"], // "success", "failed"
    )
    .unwrap()
});

/// Get all core metrics for registration.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Submission
        Box::new(BATCHES_SUBMITTED.clone()),
        Box::new(SUBMISSIONS_REJECTED.clone()),
        Box::new(OUTSTANDING_TASKS.clone()),
        // Tasks
        Box::new(CONVERSIONS_TOTAL.clone()),
        Box::new(CONVERSION_DURATION.clone()),
        Box::new(ENCODE_ATTEMPTS.clone()),
        Box::new(TASK_PANICS.clone()),
        Box::new(WORKER_REPLACEMENTS.clone()),
        // Progress & persistence
        Box::new(PROGRESS_OBSERVERS_DROPPED.clone()),
        Box::new(RECORDS_PERSISTED.clone()),
    ]
}
