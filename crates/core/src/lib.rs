//! Batch image transcoding for the blog backend.
//!
//! Images live in an [`ObjectStore`]; the [`Converter`] worker pool moves
//! each one through download, transcode, upload and delete, while a
//! [`ProgressTracker`] fans per-item outcomes out to live observers and the
//! [`ConversionService`] collects results and persists metadata.

pub mod config;
pub mod converter;
pub mod encoder;
pub mod metadata;
pub mod metrics;
pub mod progress;
pub mod service;
pub mod storage;
pub mod testing;

pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, DatabaseConfig,
    LoggingConfig, ServerConfig, StorageConfig,
};
pub use converter::{
    BatchHandle, CompletionSignal, ConversionResult, ConvertedImage, Converter, ConverterConfig,
    ConverterState, ConverterStatus, ImageDescriptor, ImageTask, Recovery, StageCode, StageError,
    SubmitError,
};
pub use encoder::{EncoderError, ImageEncoder, WebpEncoder};
pub use metadata::{ImageRecord, MetadataError, MetadataStore, SqliteMetadataStore};
pub use progress::{ItemOutcome, ProgressEvent, ProgressSnapshot, ProgressTracker};
pub use service::{BatchReport, ConversionService, ConvertedItem, FailedItem, JobPermit, JobReport, ServiceError};
pub use storage::{FsObjectStore, ObjectStore, StorageError};
