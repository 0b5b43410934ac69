//! Configuration for the converter module.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the image conversion worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConverterConfig {
    /// Capacity of the input and output queues.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Number of workers. Defaults to half the available parallelism.
    #[serde(default)]
    pub worker_count: Option<usize>,

    /// Upper bound on a single task, in seconds.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,

    /// Quality of the first encode attempt (1-100).
    #[serde(default = "default_quality")]
    pub quality: u8,

    /// Re-encode while the output is larger than this many bytes.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: u64,

    /// Encode attempts before giving up with a size limit error.
    #[serde(default = "default_max_encode_attempts")]
    pub max_encode_attempts: u32,

    /// Quality decrease between attempts.
    #[serde(default = "default_quality_step")]
    pub quality_step: u8,

    /// Quality floor for re-encoding.
    #[serde(default = "default_min_quality")]
    pub min_quality: u8,

    /// Capacity of each progress observer's queue.
    #[serde(default = "default_progress_queue_capacity")]
    pub progress_queue_capacity: usize,
}

fn default_queue_capacity() -> usize {
    30
}

fn default_task_timeout() -> u64 {
    300 // 5 minutes
}

fn default_quality() -> u8 {
    75
}

fn default_max_output_bytes() -> u64 {
    1024 * 1024 // 1 MiB
}

fn default_max_encode_attempts() -> u32 {
    5
}

fn default_quality_step() -> u8 {
    10
}

fn default_min_quality() -> u8 {
    10
}

fn default_progress_queue_capacity() -> usize {
    10
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            worker_count: None,
            task_timeout_secs: default_task_timeout(),
            quality: default_quality(),
            max_output_bytes: default_max_output_bytes(),
            max_encode_attempts: default_max_encode_attempts(),
            quality_step: default_quality_step(),
            min_quality: default_min_quality(),
            progress_queue_capacity: default_progress_queue_capacity(),
        }
    }
}

impl ConverterConfig {
    /// Sets the queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Overrides the worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.worker_count = Some(workers);
        self
    }

    /// Sets the per-task timeout in seconds.
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.task_timeout_secs = timeout_secs;
        self
    }

    /// Sets the initial encode quality.
    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality;
        self
    }

    /// Sets the output size threshold and the attempt cap.
    pub fn with_size_limit(mut self, max_output_bytes: u64, max_attempts: u32) -> Self {
        self.max_output_bytes = max_output_bytes;
        self.max_encode_attempts = max_attempts;
        self
    }

    /// Worker count actually used: the override, or half the detected
    /// parallelism with a minimum of one.
    pub fn effective_workers(&self) -> usize {
        match self.worker_count {
            Some(count) => count.max(1),
            None => {
                let parallelism = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1);
                (parallelism / 2).max(1)
            }
        }
    }

    /// Per-task timeout as a duration.
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}
