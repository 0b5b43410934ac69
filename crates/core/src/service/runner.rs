//! Conversion service implementation.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::converter::{Converter, ImageDescriptor, SubmitError};
use crate::encoder::ImageEncoder;
use crate::metadata::MetadataStore;
use crate::metrics::RECORDS_PERSISTED;
use crate::storage::ObjectStore;

use super::error::ServiceError;
use super::report::{BatchReport, JobReport};

/// Exclusive right to run a conversion job.
///
/// Obtained from [`ConversionService::reserve`]; the service accepts no
/// other job until the permit is dropped.
#[derive(Debug)]
pub struct JobPermit {
    _guard: OwnedMutexGuard<()>,
}

/// Submits images to the converter and consumes its results.
pub struct ConversionService<S, E, M>
where
    S: ObjectStore + 'static,
    E: ImageEncoder + 'static,
    M: MetadataStore + ?Sized,
{
    converter: Arc<Converter<S, E>>,
    metadata: Arc<M>,
    job_lock: Arc<Mutex<()>>,
    last_job: RwLock<Option<JobReport>>,
}

impl<S, E, M> ConversionService<S, E, M>
where
    S: ObjectStore + 'static,
    E: ImageEncoder + 'static,
    M: MetadataStore + ?Sized,
{
    pub fn new(converter: Arc<Converter<S, E>>, metadata: Arc<M>) -> Self {
        Self {
            converter,
            metadata,
            job_lock: Arc::new(Mutex::new(())),
            last_job: RwLock::new(None),
        }
    }

    pub fn converter(&self) -> &Arc<Converter<S, E>> {
        &self.converter
    }

    pub fn metadata(&self) -> &Arc<M> {
        &self.metadata
    }

    /// Report of the most recent job, finished or still running.
    pub async fn last_job(&self) -> Option<JobReport> {
        self.last_job.read().await.clone()
    }

    /// Claim the service for one job without waiting.
    pub fn reserve(&self) -> Result<JobPermit, ServiceError> {
        let guard = Arc::clone(&self.job_lock)
            .try_lock_owned()
            .map_err(|_| ServiceError::JobInProgress)?;

        let status = self.converter.status();
        if status.outstanding > 0 {
            return Err(ServiceError::Submit(SubmitError::Busy {
                outstanding: status.outstanding,
            }));
        }

        Ok(JobPermit { _guard: guard })
    }

    /// Objects under `prefix` that the encoder can convert, skipping those
    /// already in the target format.
    pub async fn plan_prefix(&self, prefix: &str) -> Result<Vec<ImageDescriptor>, ServiceError> {
        let encoder = self.converter.encoder();
        let target = encoder.target_extension();

        let images: Vec<ImageDescriptor> = self
            .converter
            .store()
            .list(prefix)
            .await?
            .into_iter()
            .map(ImageDescriptor::from_path)
            .filter(|image| {
                encoder.accepts(&image.format) && !image.format.eq_ignore_ascii_case(target)
            })
            .collect();

        debug!(prefix, count = images.len(), "Planned conversion");
        Ok(images)
    }

    /// Convert every eligible object under `prefix`.
    pub async fn convert_prefix(
        &self,
        prefix: &str,
        cancel: &CancellationToken,
    ) -> Result<JobReport, ServiceError> {
        let images = self.plan_prefix(prefix).await?;
        Ok(self.convert_images(images, cancel).await)
    }

    /// Convert `images`, waiting for any running job to finish first.
    pub async fn convert_images(
        &self,
        images: Vec<ImageDescriptor>,
        cancel: &CancellationToken,
    ) -> JobReport {
        let permit = JobPermit {
            _guard: Arc::clone(&self.job_lock).lock_owned().await,
        };
        self.run_job(permit, images, cancel).await
    }

    /// Convert `images` in batches no larger than the converter's queue.
    ///
    /// Stops at the first batch the converter rejects outright or when
    /// `cancel` fires. The report is also kept as [`last_job`](Self::last_job).
    pub async fn run_job(
        &self,
        _permit: JobPermit,
        images: Vec<ImageDescriptor>,
        cancel: &CancellationToken,
    ) -> JobReport {
        let chunk_size = self.converter.config().queue_capacity.max(1);
        let mut job = JobReport::new(images.len());
        *self.last_job.write().await = Some(job.clone());
        info!(total = images.len(), chunk_size, "Conversion job started");

        for chunk in images.chunks(chunk_size) {
            if cancel.is_cancelled() {
                job.error = Some("cancelled".to_string());
                break;
            }

            match self.convert_batch(chunk.to_vec(), cancel).await {
                Ok(report) => {
                    let stop = report.cancelled || (!report.completed && report.submitted > 0);
                    job.batches.push(report);
                    *self.last_job.write().await = Some(job.clone());
                    if stop {
                        job.error = Some("batch did not complete".to_string());
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Conversion job stopped");
                    job.error = Some(e.to_string());
                    break;
                }
            }
        }

        job.finished_at = Some(Utc::now());
        info!(
            succeeded = job.succeeded(),
            failed = job.failed(),
            rejected = job.rejected(),
            batches = job.batches.len(),
            "Conversion job finished"
        );
        *self.last_job.write().await = Some(job.clone());
        job
    }

    /// Submit one batch and wait for all of its results.
    ///
    /// If the converter takes only part of the batch, the enqueued part is
    /// still collected and the rest is listed as rejected. Cancelling
    /// `cancel` stops in-flight tasks and returns what was received so far.
    pub async fn convert_batch(
        &self,
        images: Vec<ImageDescriptor>,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, ServiceError> {
        let submitted = images.len();
        let mut report = match self.converter.add_batch_tasks(images.clone(), cancel) {
            Ok(handle) if handle.is_empty() => {
                let mut report = BatchReport::new(0, 0);
                report.completed = true;
                return Ok(report);
            }
            Ok(handle) => BatchReport::new(handle.id, handle.size),
            Err(e) => match e.partial_batch() {
                Some(batch_id) => {
                    let enqueued = e.enqueued();
                    warn!(batch_id, enqueued, submitted, error = %e, "Batch partially enqueued");
                    let mut report = BatchReport::new(batch_id, enqueued);
                    report.rejected = images[enqueued..].iter().map(|i| i.path.clone()).collect();
                    report
                }
                None => return Err(e.into()),
            },
        };

        self.drain(&mut report, cancel).await;
        self.persist(&mut report);

        info!(
            batch_id = report.batch_id,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            rejected = report.rejected.len(),
            persisted = report.persisted,
            "Batch processed"
        );
        Ok(report)
    }

    async fn drain(&self, report: &mut BatchReport, cancel: &CancellationToken) {
        let output = self.converter.output_channel();
        let completion = self.converter.completion_channel();
        let batch_id = report.batch_id;
        let mut signalled = false;

        while report.received() < report.submitted || !signalled {
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(batch_id, received = report.received(), "Stopped waiting for batch");
                    report.cancelled = true;
                    return;
                }
                received = output.recv_async(), if report.received() < report.submitted => match received {
                    Ok(result) if result.batch_id == batch_id => report.record(&result),
                    Ok(result) => debug!(batch_id = result.batch_id, "Discarding result of an earlier batch"),
                    Err(_) => {
                        warn!(batch_id, "Output channel closed before batch finished");
                        return;
                    }
                },
                signal = completion.recv_async(), if !signalled => match signal {
                    Ok(signal) if signal.batch_id == batch_id => {
                        signalled = true;
                        report.complete(&signal);
                        if !signal.success {
                            // Shut down mid-batch; results not yet published are gone.
                            while let Ok(result) = output.try_recv() {
                                if result.batch_id == batch_id {
                                    report.record(&result);
                                }
                            }
                            return;
                        }
                    }
                    Ok(signal) => debug!(batch_id = signal.batch_id, "Discarding completion of an earlier batch"),
                    Err(_) => {
                        warn!(batch_id, "Completion channel closed before batch finished");
                        signalled = true;
                    }
                },
            }
        }
    }

    fn persist(&self, report: &mut BatchReport) {
        if report.records.is_empty() {
            return;
        }

        match self.metadata.save_batch(&report.records) {
            Ok(count) => {
                RECORDS_PERSISTED
                    .with_label_values(&["success"])
                    .inc_by(count as u64);
                report.persisted = count;
            }
            Err(e) => {
                RECORDS_PERSISTED
                    .with_label_values(&["failed"])
                    .inc_by(report.records.len() as u64);
                error!(batch_id = report.batch_id, error = %e, "Failed to persist image metadata");
                report.persist_error = Some(e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::ConverterConfig;
    use crate::testing::{fixtures, MockEncoder, MockMetadataStore, MockObjectStore};

    type TestService = ConversionService<MockObjectStore, MockEncoder, MockMetadataStore>;

    async fn service(queue_capacity: usize) -> (TestService, MockObjectStore, MockMetadataStore) {
        let store = MockObjectStore::new();
        let metadata = MockMetadataStore::new();
        let converter = Converter::new(
            ConverterConfig::default()
                .with_queue_capacity(queue_capacity)
                .with_workers(2),
            store.clone(),
            MockEncoder::new(),
        );
        converter.start();
        let service = ConversionService::new(Arc::new(converter), Arc::new(metadata.clone()));
        (service, store, metadata)
    }

    #[tokio::test]
    async fn test_plan_prefix_filters_formats() {
        let (service, store, _) = service(4).await;
        for path in ["posts/a.jpg", "posts/b.PNG", "posts/c.webp", "posts/notes.txt", "pages/d.jpg"] {
            store.insert(path, fixtures::image_bytes(10)).await;
        }

        let planned: Vec<String> = service
            .plan_prefix("posts/")
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.path)
            .collect();

        assert_eq!(planned, vec!["posts/a.jpg", "posts/b.PNG"]);
        service.converter().shutdown().await;
    }

    #[tokio::test]
    async fn test_convert_batch_persists_successes() {
        let (service, store, metadata) = service(4).await;
        store.insert("a.jpg", fixtures::image_bytes(40)).await;

        let report = service
            .convert_batch(fixtures::images(&["a.jpg", "missing.jpg"]), &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.completed);
        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.persisted, 1);
        assert_eq!(metadata.saved()[0].converted_path, "a.webp");
        service.converter().shutdown().await;
    }

    #[tokio::test]
    async fn test_persist_failure_is_reported() {
        let (service, store, metadata) = service(4).await;
        store.insert("a.jpg", fixtures::image_bytes(40)).await;
        metadata.set_failing(true);

        let report = service
            .convert_batch(fixtures::images(&["a.jpg"]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.persisted, 0);
        assert!(report.persist_error.is_some());
        service.converter().shutdown().await;
    }

    #[tokio::test]
    async fn test_reserve_is_exclusive() {
        let (service, _, _) = service(4).await;

        let permit = service.reserve().unwrap();
        assert!(matches!(service.reserve(), Err(ServiceError::JobInProgress)));
        drop(permit);
        assert!(service.reserve().is_ok());
        service.converter().shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_batch_report() {
        let (service, _, _) = service(4).await;

        let report = service
            .convert_batch(Vec::new(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.completed);
        assert_eq!(report.received(), 0);
        service.converter().shutdown().await;
    }

    #[tokio::test]
    async fn test_closed_converter_is_unavailable() {
        let (service, _, _) = service(4).await;
        service.converter().shutdown().await;

        let err = service
            .convert_batch(fixtures::images(&["a.jpg"]), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_unavailable());
    }
}
