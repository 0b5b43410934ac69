//! The pipeline consumer.
//!
//! [`ConversionService`] sits between callers (the HTTP layer) and the
//! [`Converter`](crate::converter::Converter): it submits batches, drains
//! the output channel until the batch's completion signal, partitions the
//! results into succeeded and failed, and persists metadata for the
//! succeeded ones.

mod error;
mod report;
mod runner;

pub use error::ServiceError;
pub use report::{BatchReport, ConvertedItem, FailedItem, JobReport};
pub use runner::{ConversionService, JobPermit};
