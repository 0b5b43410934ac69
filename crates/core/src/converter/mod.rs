//! Batch image conversion.
//!
//! The [`Converter`] is a bounded worker pool. A batch of
//! [`ImageDescriptor`]s is submitted with [`Converter::add_batch_tasks`];
//! each image is downloaded from the object store, transcoded, uploaded
//! under its new extension and the original deleted. Every task produces
//! exactly one [`ConversionResult`] on the output channel, and a
//! [`CompletionSignal`] fires once the whole batch is done.
//!
//! # Failure handling
//!
//! Per-task failures are reported in the result, tagged with the stage that
//! failed. Nothing is retried inside the pool. A panic while processing a
//! task is caught and reported as [`StageError::Panicked`], so completion
//! detection is never lost to a crash.

mod config;
mod error;
mod pool;
mod stages;
mod types;

pub use config::ConverterConfig;
pub use error::{Recovery, StageCode, StageError, SubmitError};
pub use pool::Converter;
pub use types::{
    BatchHandle, CompletionSignal, ConversionResult, ConvertedImage, ConverterState,
    ConverterStatus, ImageDescriptor, ImageTask,
};
