//! The worker pool.
//!
//! A [`Converter`] owns a bounded input queue, a bounded output queue and a
//! fixed set of workers. Submissions never block: a full queue is reported
//! as [`SubmitError::QueueFull`]. Publishing results does block, which is
//! what throttles the pool against a slow consumer.

use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::encoder::ImageEncoder;
use crate::metrics::{
    BATCHES_SUBMITTED, CONVERSIONS_TOTAL, CONVERSION_DURATION, ENCODE_ATTEMPTS,
    OUTSTANDING_TASKS, SUBMISSIONS_REJECTED, TASK_PANICS, WORKER_REPLACEMENTS,
};
use crate::progress::{ItemOutcome, ProgressTracker};
use crate::storage::ObjectStore;

use super::config::ConverterConfig;
use super::error::{StageError, SubmitError};
use super::stages::TaskPipeline;
use super::types::{
    BatchHandle, CompletionSignal, ConversionResult, ConverterState, ConverterStatus,
    ImageDescriptor, ImageTask,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bookkeeping shared between the converter handle and its workers.
struct Shared {
    state: AtomicU8,
    outstanding: AtomicUsize,
    current_batch: AtomicU64,
    batch_succeeded: AtomicUsize,
    batch_failed: AtomicUsize,
    total_processed: AtomicU64,
    total_failed: AtomicU64,
    batch_scope: Mutex<Option<CancellationToken>>,
    completion_tx: Mutex<Option<flume::Sender<CompletionSignal>>>,
    active_workers: AtomicUsize,
    /// Makes the next worker to finish a task panic outside the task boundary.
    #[cfg(test)]
    crash_worker_loop: std::sync::atomic::AtomicBool,
}

impl Shared {
    fn new(completion_tx: flume::Sender<CompletionSignal>) -> Self {
        Self {
            state: AtomicU8::new(ConverterState::Uninitialized.as_u8()),
            outstanding: AtomicUsize::new(0),
            current_batch: AtomicU64::new(0),
            batch_succeeded: AtomicUsize::new(0),
            batch_failed: AtomicUsize::new(0),
            total_processed: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            batch_scope: Mutex::new(None),
            completion_tx: Mutex::new(Some(completion_tx)),
            active_workers: AtomicUsize::new(0),
            #[cfg(test)]
            crash_worker_loop: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn state(&self) -> ConverterState {
        ConverterState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn is_running(&self) -> bool {
        self.state() == ConverterState::Running
    }

    fn transition(&self, from: ConverterState, to: ConverterState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn begin_batch(&self, batch_id: u64) {
        self.current_batch.store(batch_id, Ordering::Release);
        self.batch_succeeded.store(0, Ordering::Release);
        self.batch_failed.store(0, Ordering::Release);
    }

    fn record(&self, result: &ConversionResult) {
        self.total_processed.fetch_add(1, Ordering::Relaxed);
        if result.success {
            self.batch_succeeded.fetch_add(1, Ordering::AcqRel);
        } else {
            self.total_failed.fetch_add(1, Ordering::Relaxed);
            self.batch_failed.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn batch_totals(&self) -> (usize, usize) {
        (
            self.batch_succeeded.load(Ordering::Acquire),
            self.batch_failed.load(Ordering::Acquire),
        )
    }

    /// Count one task of `batch_id` as done; the last one completes the batch.
    ///
    /// The batch totals are read while this task is still counted, so a
    /// batch accepted right after the counter reaches zero cannot reset them
    /// before the signal is built.
    fn finish_task(&self, batch_id: u64) {
        let mut totals = None;
        let decremented =
            self.outstanding
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    totals = (n == 1).then(|| self.batch_totals());
                    n.checked_sub(1)
                });
        match decremented {
            Ok(previous) => {
                OUTSTANDING_TASKS.set((previous - 1) as i64);
                if let Some((succeeded, failed)) = totals {
                    self.complete_batch(batch_id, succeeded, failed);
                }
            }
            Err(_) => debug!(batch_id, "Task finished after its batch was closed out"),
        }
    }

    /// Remove tasks that were counted but never enqueued.
    fn abandon(&self, batch_id: u64, abandoned: usize, enqueued: usize) {
        if abandoned == 0 {
            return;
        }

        let mut totals = (0, 0);
        let previous = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n > 0 && n <= abandoned {
                    totals = self.batch_totals();
                }
                Some(n.saturating_sub(abandoned))
            })
            .unwrap_or_default();
        let remaining = previous.saturating_sub(abandoned);
        OUTSTANDING_TASKS.set(remaining as i64);

        // The enqueued part may already be done; nobody else will see zero.
        if previous > 0 && remaining == 0 && enqueued > 0 {
            let (succeeded, failed) = totals;
            self.complete_batch(batch_id, succeeded, failed);
        }
    }

    fn complete_batch(&self, batch_id: u64, succeeded: usize, failed: usize) {
        info!(batch_id, succeeded, failed, "Batch completed");

        self.emit(CompletionSignal {
            batch_id,
            success: true,
            message: format!(
                "Batch {} completed: {} succeeded, {} failed",
                batch_id, succeeded, failed
            ),
            succeeded,
            failed,
            timestamp: Utc::now(),
        });
    }

    fn emit(&self, signal: CompletionSignal) {
        let guard = lock(&self.completion_tx);
        match guard.as_ref() {
            Some(tx) => {
                if tx.send(signal).is_err() {
                    debug!("No completion listener");
                }
            }
            None => debug!(batch_id = signal.batch_id, "Completion channel closed, dropping signal"),
        }
    }
}

/// Decrements the outstanding counter when dropped, so a task is counted
/// exactly once however its processing ends.
struct TaskGuard<'a> {
    shared: &'a Shared,
    batch_id: u64,
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        self.shared.finish_task(self.batch_id);
    }
}

/// Counts a worker loop as alive until it returns or unwinds.
struct LiveWorker<'a>(&'a Shared);

impl<'a> LiveWorker<'a> {
    fn enter(shared: &'a Shared) -> Self {
        shared.active_workers.fetch_add(1, Ordering::AcqRel);
        Self(shared)
    }
}

impl Drop for LiveWorker<'_> {
    fn drop(&mut self) {
        self.0.active_workers.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Worker<S, E> {
    id: usize,
    shared: Arc<Shared>,
    pipeline: Arc<TaskPipeline<S, E>>,
    progress: Option<ProgressTracker>,
    input: flume::Receiver<ImageTask>,
    output: flume::Sender<ConversionResult>,
    shutdown: CancellationToken,
}

impl<S, E> Clone for Worker<S, E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            shared: Arc::clone(&self.shared),
            pipeline: Arc::clone(&self.pipeline),
            progress: self.progress.clone(),
            input: self.input.clone(),
            output: self.output.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<S, E> Worker<S, E>
where
    S: ObjectStore + 'static,
    E: ImageEncoder + 'static,
{
    fn with_id(&self, id: usize) -> Self {
        let mut worker = self.clone();
        worker.id = id;
        worker
    }

    /// Takes tasks until shutdown or until the input queue closes.
    ///
    /// Not a fair race between shutdown and queued work: the wait is biased
    /// toward shutdown so a closing pool stops promptly even with a full queue.
    async fn run(self) {
        let _alive = LiveWorker::enter(&self.shared);
        debug!(worker = self.id, "Worker started");

        loop {
            #[cfg(test)]
            if self.shared.crash_worker_loop.swap(false, Ordering::AcqRel) {
                panic!("worker {} loop crashed", self.id);
            }

            let task = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                received = self.input.recv_async() => match received {
                    Ok(task) => task,
                    Err(_) => break,
                },
            };
            self.process(task).await;
        }

        debug!(worker = self.id, "Worker stopped");
    }

    async fn process(&self, task: ImageTask) {
        let _guard = TaskGuard {
            shared: &self.shared,
            batch_id: task.batch_id,
        };
        let started = Instant::now();
        debug!(worker = self.id, batch_id = task.batch_id, image = %task.image.path, "Processing image");

        let outcome = match AssertUnwindSafe(self.pipeline.execute(&task))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                TASK_PANICS.inc();
                error!(
                    worker = self.id,
                    batch_id = task.batch_id,
                    image = %task.image.path,
                    panic = %message,
                    backtrace = %Backtrace::force_capture(),
                    "Task panicked"
                );
                Err(StageError::Panicked { message })
            }
        };

        let result = ConversionResult::new(
            task.batch_id,
            task.image,
            outcome,
            started.elapsed().as_millis() as u64,
        );
        self.report(&result).await;
        self.publish(result).await;
    }

    async fn report(&self, result: &ConversionResult) {
        self.shared.record(result);

        let label = if result.success { "success" } else { "failed" };
        let kind = result.error.as_ref().map_or("none", StageError::kind);
        CONVERSIONS_TOTAL.with_label_values(&[label, kind]).inc();
        CONVERSION_DURATION
            .with_label_values(&[label])
            .observe(result.duration_ms as f64 / 1000.0);

        match (&result.converted, &result.error) {
            (Some(converted), _) => {
                ENCODE_ATTEMPTS.observe(f64::from(converted.encode_attempts));
                info!(
                    worker = self.id,
                    batch_id = result.batch_id,
                    image = %result.image.path,
                    converted = %converted.path,
                    size_bytes = converted.size_bytes,
                    duration_ms = result.duration_ms,
                    "Image converted"
                );
            }
            (None, Some(e)) => warn!(
                worker = self.id,
                batch_id = result.batch_id,
                image = %result.image.path,
                stage = e.stage().map_or("none", |s| s.as_str()),
                error = %e,
                "Image conversion failed"
            ),
            (None, None) => {}
        }

        if let Some(progress) = &self.progress {
            progress
                .update_progress(ItemOutcome::from(result), result.success)
                .await;
        }
    }

    async fn publish(&self, result: ConversionResult) {
        tokio::select! {
            biased;
            sent = self.output.send_async(result) => {
                if sent.is_err() {
                    debug!(worker = self.id, "Output queue closed, dropping result");
                }
            }
            _ = self.shutdown.cancelled() => {
                debug!(worker = self.id, "Shutting down, dropping unpublished result");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Runs the workers and replaces any whose loop dies while the pool is open.
async fn supervise<S, E>(template: Worker<S, E>, count: usize)
where
    S: ObjectStore + 'static,
    E: ImageEncoder + 'static,
{
    let mut workers = JoinSet::new();
    for id in 0..count {
        workers.spawn(template.with_id(id).run());
    }
    let mut next_id = count;

    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(()) => {}
            Err(e) if e.is_panic() => {
                error!(error = %e, "Worker crashed");
                if template.shared.is_running() && !template.shutdown.is_cancelled() {
                    WORKER_REPLACEMENTS.inc();
                    warn!(worker = next_id, "Spawning replacement worker");
                    workers.spawn(template.with_id(next_id).run());
                    next_id += 1;
                }
            }
            Err(e) => warn!(error = %e, "Worker ended unexpectedly"),
        }
    }

    debug!("All workers stopped");
}

/// Bounded worker pool that converts batches of stored images.
///
/// Constructed explicitly and shared by reference (usually in an `Arc`);
/// nothing about it is process-global. Only one batch may be in flight at a
/// time: a submission while tasks are outstanding fails with
/// [`SubmitError::Busy`].
///
/// # Example
///
/// ```rust,ignore
/// let converter = Converter::new(config, FsObjectStore::new("data"), WebpEncoder::new())
///     .with_progress(ProgressTracker::new(10));
/// converter.start();
///
/// let batch = converter.add_batch_tasks(images, &CancellationToken::new())?;
/// let results = converter.output_channel();
/// let done = converter.completion_channel();
/// // drain `results` until `done` yields a signal for `batch.id`
///
/// converter.shutdown().await;
/// ```
pub struct Converter<S, E>
where
    S: ObjectStore + 'static,
    E: ImageEncoder + 'static,
{
    config: ConverterConfig,
    workers: usize,
    store: Arc<S>,
    encoder: Arc<E>,
    pipeline: Arc<TaskPipeline<S, E>>,
    progress: Option<ProgressTracker>,
    shared: Arc<Shared>,
    next_batch: AtomicU64,

    input_tx: Mutex<Option<flume::Sender<ImageTask>>>,
    input_rx: flume::Receiver<ImageTask>,
    output_tx: Mutex<Option<flume::Sender<ConversionResult>>>,
    output_rx: flume::Receiver<ConversionResult>,
    completion_rx: flume::Receiver<CompletionSignal>,
    shutdown: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl<S, E> Converter<S, E>
where
    S: ObjectStore + 'static,
    E: ImageEncoder + 'static,
{
    /// Create a converter. Workers are not started until [`start`](Self::start).
    pub fn new(config: ConverterConfig, store: S, encoder: E) -> Self {
        Self::from_shared(config, Arc::new(store), Arc::new(encoder))
    }

    /// Create a converter around collaborators that are shared elsewhere.
    pub fn from_shared(config: ConverterConfig, store: Arc<S>, encoder: Arc<E>) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (input_tx, input_rx) = flume::bounded(capacity);
        let (output_tx, output_rx) = flume::bounded(capacity);
        let (completion_tx, completion_rx) = flume::unbounded();
        let pipeline = Arc::new(TaskPipeline::new(
            Arc::clone(&store),
            Arc::clone(&encoder),
            &config,
        ));

        Self {
            workers: config.effective_workers(),
            config,
            store,
            encoder,
            pipeline,
            progress: None,
            shared: Arc::new(Shared::new(completion_tx)),
            next_batch: AtomicU64::new(0),
            input_tx: Mutex::new(Some(input_tx)),
            input_rx,
            output_tx: Mutex::new(Some(output_tx)),
            output_rx,
            completion_rx,
            shutdown: CancellationToken::new(),
            supervisor: Mutex::new(None),
        }
    }

    /// Report every per-item outcome to `tracker` as well.
    pub fn with_progress(mut self, tracker: ProgressTracker) -> Self {
        self.progress = Some(tracker);
        self
    }

    /// Start the workers. Must be called from within a Tokio runtime.
    /// Calling it again is a no-op.
    pub fn start(&self) {
        if !self
            .shared
            .transition(ConverterState::Uninitialized, ConverterState::Running)
        {
            warn!(state = ?self.shared.state(), "Converter already started");
            return;
        }

        let Some(output) = lock(&self.output_tx).clone() else {
            return;
        };

        let template = Worker {
            id: 0,
            shared: Arc::clone(&self.shared),
            pipeline: Arc::clone(&self.pipeline),
            progress: self.progress.clone(),
            input: self.input_rx.clone(),
            output,
            shutdown: self.shutdown.clone(),
        };

        info!(
            workers = self.workers,
            queue_capacity = self.config.queue_capacity,
            timeout_secs = self.config.task_timeout_secs,
            store = self.store.name(),
            encoder = self.encoder.name(),
            "Starting converter"
        );

        *lock(&self.supervisor) = Some(tokio::spawn(supervise(template, self.workers)));
    }

    /// Submit a batch of images.
    ///
    /// Never blocks. Tasks are enqueued in order; if the queue fills up or
    /// `scope` is cancelled part way, the call fails but the tasks already
    /// enqueued still run, and the batch completes once they are done.
    /// Cancelling `scope` later stops in-flight tasks at their next stage.
    pub fn add_batch_tasks(
        &self,
        images: Vec<ImageDescriptor>,
        scope: &CancellationToken,
    ) -> Result<BatchHandle, SubmitError> {
        if !self.shared.is_running() {
            return Err(self.reject(SubmitError::ConverterClosed));
        }
        let Some(input) = lock(&self.input_tx).clone() else {
            return Err(self.reject(SubmitError::ConverterClosed));
        };

        if images.is_empty() {
            return Ok(BatchHandle::empty());
        }

        let size = images.len();
        if let Err(outstanding) =
            self.shared
                .outstanding
                .compare_exchange(0, size, Ordering::AcqRel, Ordering::Acquire)
        {
            return Err(self.reject(SubmitError::Busy { outstanding }));
        }

        let batch_id = self.next_batch.fetch_add(1, Ordering::Relaxed) + 1;
        if !self.shared.is_running() {
            self.shared.abandon(batch_id, size, 0);
            return Err(self.reject(SubmitError::ConverterClosed));
        }

        self.shared.begin_batch(batch_id);
        OUTSTANDING_TASKS.set(size as i64);
        if let Some(progress) = &self.progress {
            progress.reset(size);
        }

        let batch_scope = scope.child_token();
        if let Some(previous) = lock(&self.shared.batch_scope).replace(batch_scope.clone()) {
            previous.cancel();
        }

        let mut enqueued = 0;
        for image in images {
            if scope.is_cancelled() {
                let error = SubmitError::Cancelled { batch_id, enqueued };
                return Err(self.abort(batch_id, size, error));
            }

            let task = ImageTask {
                batch_id,
                image,
                scope: batch_scope.clone(),
            };
            match input.try_send(task) {
                Ok(()) => enqueued += 1,
                Err(flume::TrySendError::Full(_)) => {
                    let error = SubmitError::QueueFull { batch_id, enqueued };
                    return Err(self.abort(batch_id, size, error));
                }
                Err(flume::TrySendError::Disconnected(_)) => {
                    self.shared.abandon(batch_id, size - enqueued, enqueued);
                    return Err(self.reject(SubmitError::ConverterClosed));
                }
            }
        }

        BATCHES_SUBMITTED.inc();
        info!(batch_id, size, "Batch accepted");
        Ok(BatchHandle { id: batch_id, size })
    }

    fn reject(&self, error: SubmitError) -> SubmitError {
        SUBMISSIONS_REJECTED
            .with_label_values(&[error.reason()])
            .inc();
        debug!(error = %error, "Batch rejected");
        error
    }

    fn abort(&self, batch_id: u64, size: usize, error: SubmitError) -> SubmitError {
        let enqueued = error.enqueued();
        warn!(batch_id, size, enqueued, error = %error, "Batch submission aborted");
        self.shared.abandon(batch_id, size - enqueued, enqueued);
        self.reject(error)
    }

    /// Whether no task is outstanding, i.e. a new batch would be accepted.
    pub fn is_empty(&self) -> bool {
        self.shared.outstanding.load(Ordering::Acquire) == 0
    }

    /// Results of every processed task, in completion order.
    pub fn output_channel(&self) -> flume::Receiver<ConversionResult> {
        self.output_rx.clone()
    }

    /// One signal per completed batch.
    pub fn completion_channel(&self) -> flume::Receiver<CompletionSignal> {
        self.completion_rx.clone()
    }

    pub fn state(&self) -> ConverterState {
        self.shared.state()
    }

    pub fn status(&self) -> ConverterStatus {
        let current = self.shared.current_batch.load(Ordering::Acquire);
        ConverterStatus {
            state: self.shared.state(),
            workers: self.workers,
            active_workers: self.shared.active_workers.load(Ordering::Acquire),
            queue_capacity: self.config.queue_capacity,
            queued: self.input_rx.len(),
            outstanding: self.shared.outstanding.load(Ordering::Acquire),
            current_batch: (current != 0).then_some(current),
            total_processed: self.shared.total_processed.load(Ordering::Relaxed),
            total_failed: self.shared.total_failed.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    pub fn progress(&self) -> Option<&ProgressTracker> {
        self.progress.as_ref()
    }

    /// Stop the workers and close every queue.
    ///
    /// In-flight tasks stop at their next stage boundary. If a batch is still
    /// outstanding, a final unsuccessful completion signal is emitted for it.
    /// Safe to call more than once; later calls return immediately.
    pub async fn shutdown(&self) {
        if !self
            .shared
            .transition(ConverterState::Running, ConverterState::ShuttingDown)
        {
            if self
                .shared
                .transition(ConverterState::Uninitialized, ConverterState::Closed)
            {
                self.close_channels();
                info!("Converter closed before start");
            } else {
                debug!("Converter already shut down");
            }
            return;
        }

        info!("Shutting down converter");
        lock(&self.input_tx).take();
        let batch_scope = lock(&self.shared.batch_scope).take();
        if let Some(scope) = batch_scope {
            scope.cancel();
        }
        self.shutdown.cancel();

        let supervisor = lock(&self.supervisor).take();
        if let Some(handle) = supervisor {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker supervisor failed");
            }
        }

        let never_started = self.input_rx.drain().count();
        let outstanding = self.shared.outstanding.swap(0, Ordering::AcqRel);
        OUTSTANDING_TASKS.set(0);
        if outstanding > 0 {
            let batch_id = self.shared.current_batch.load(Ordering::Acquire);
            warn!(batch_id, outstanding, never_started, "Shutting down with batch in flight");
            let (succeeded, failed) = self.shared.batch_totals();
            self.shared.emit(CompletionSignal {
                batch_id,
                success: false,
                message: format!(
                    "Converter shut down with {} tasks outstanding ({} never started)",
                    outstanding, never_started
                ),
                succeeded,
                failed,
                timestamp: Utc::now(),
            });
        }

        self.close_channels();
        self.shared
            .state
            .store(ConverterState::Closed.as_u8(), Ordering::Release);
        info!("Converter shut down");
    }

    fn close_channels(&self) {
        lock(&self.input_tx).take();
        lock(&self.output_tx).take();
        lock(&self.shared.completion_tx).take();
    }
}

impl<S, E> Drop for Converter<S, E>
where
    S: ObjectStore + 'static,
    E: ImageEncoder + 'static,
{
    fn drop(&mut self) {
        if let Some(scope) = lock(&self.shared.batch_scope).take() {
            scope.cancel();
        }
        self.shutdown.cancel();
    }
}
