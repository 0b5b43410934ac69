//! The per-task pipeline: download, transcode, upload, delete original.
//!
//! The stages form a saga without compensation. A failure in a later stage
//! never undoes an earlier one; instead the error's stage tag tells the
//! consumer what was left behind (see [`StageError::recovery`]).

use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::encoder::ImageEncoder;
use crate::storage::{ObjectStore, StorageError};

use super::config::ConverterConfig;
use super::error::{StageCode, StageError};
use super::types::{ConvertedImage, ImageDescriptor, ImageTask};

/// Encode loop parameters taken from the converter config.
#[derive(Debug, Clone)]
pub(crate) struct EncodeSettings {
    pub quality: u8,
    pub min_quality: u8,
    pub quality_step: u8,
    pub max_output_bytes: u64,
    pub max_attempts: u32,
}

impl From<&ConverterConfig> for EncodeSettings {
    fn from(config: &ConverterConfig) -> Self {
        Self {
            quality: config.quality,
            min_quality: config.min_quality.min(config.quality),
            quality_step: config.quality_step,
            max_output_bytes: config.max_output_bytes,
            max_attempts: config.max_encode_attempts.max(1),
        }
    }
}

/// Output of the transcode stage.
#[derive(Debug)]
pub(crate) struct Encoded {
    pub bytes: Vec<u8>,
    pub quality: u8,
    pub attempts: u32,
}

/// Time-bounded sub-scope of a task's cancellation scope.
///
/// Cancellation is only observed between stages; a running stage finishes.
/// The deadline, however, interrupts the running stage. The child token is
/// cancelled when the scope is dropped.
pub(crate) struct TaskScope {
    token: CancellationToken,
    deadline: Instant,
    timeout_secs: u64,
}

impl TaskScope {
    pub(crate) fn derive(parent: &CancellationToken, timeout: Duration) -> Self {
        Self {
            token: parent.child_token(),
            deadline: Instant::now() + timeout,
            timeout_secs: timeout.as_secs(),
        }
    }

    /// Runs one stage, checking the scope first and enforcing the deadline.
    pub(crate) async fn run<T, F>(&self, stage: StageCode, fut: F) -> Result<T, StageError>
    where
        F: Future<Output = Result<T, StageError>>,
    {
        if self.token.is_cancelled() {
            return Err(StageError::Cancelled { stage });
        }

        match tokio::time::timeout_at(self.deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(StageError::Timeout {
                stage,
                timeout_secs: self.timeout_secs,
            }),
        }
    }
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Executes the four stages for one task.
pub(crate) struct TaskPipeline<S, E> {
    store: Arc<S>,
    encoder: Arc<E>,
    settings: EncodeSettings,
    timeout: Duration,
}

impl<S, E> TaskPipeline<S, E>
where
    S: ObjectStore + 'static,
    E: ImageEncoder + 'static,
{
    pub(crate) fn new(store: Arc<S>, encoder: Arc<E>, config: &ConverterConfig) -> Self {
        Self {
            store,
            encoder,
            settings: EncodeSettings::from(config),
            timeout: config.task_timeout(),
        }
    }

    pub(crate) async fn execute(&self, task: &ImageTask) -> Result<ConvertedImage, StageError> {
        let scope = TaskScope::derive(&task.scope, self.timeout);
        let image = &task.image;
        let target = image.target_path(self.encoder.target_extension());

        let source = scope.run(StageCode::Download, self.download(image)).await?;
        let encoded = scope.run(StageCode::Convert, self.transcode(source)).await?;
        let converted = scope
            .run(StageCode::Upload, self.upload(&target, encoded))
            .await?;

        // Converting in place (already in the target format) overwrote the original.
        if target != image.path {
            scope
                .run(StageCode::Delete, self.delete_original(image, &target))
                .await?;
        }

        Ok(converted)
    }

    async fn download(&self, image: &ImageDescriptor) -> Result<Vec<u8>, StageError> {
        self.store
            .get(&image.path)
            .await
            .map_err(|e| StageError::Download {
                path: image.path.clone(),
                reason: e.to_string(),
            })
    }

    async fn transcode(&self, source: Vec<u8>) -> Result<Encoded, StageError> {
        let encoder = Arc::clone(&self.encoder);
        let settings = self.settings.clone();

        let joined = tokio::task::spawn_blocking(move || {
            transcode_until_small(encoder.as_ref(), &source, &settings)
        })
        .await;

        match joined {
            Ok(result) => result,
            // Surface encoder panics at the worker boundary like any other panic.
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(StageError::Convert {
                reason: e.to_string(),
            }),
        }
    }

    async fn upload(&self, target: &str, encoded: Encoded) -> Result<ConvertedImage, StageError> {
        let size_bytes = encoded.bytes.len() as u64;
        let checksum = format!("{:x}", Sha256::digest(&encoded.bytes));
        let staging = format!("{target}.part");
        let upload_error = |e: StorageError| StageError::Upload {
            path: target.to_string(),
            reason: e.to_string(),
        };

        self.store
            .put(&staging, encoded.bytes)
            .await
            .map_err(upload_error)?;

        if let Err(e) = self.store.rename(&staging, target).await {
            if let Err(cleanup) = self.store.delete(&staging).await {
                warn!(path = %staging, error = %cleanup, "Failed to remove staging object");
            }
            return Err(upload_error(e));
        }

        Ok(ConvertedImage {
            path: target.to_string(),
            size_bytes,
            checksum,
            quality: encoded.quality,
            encode_attempts: encoded.attempts,
        })
    }

    async fn delete_original(&self, image: &ImageDescriptor, target: &str) -> Result<(), StageError> {
        self.store
            .delete(&image.path)
            .await
            .map_err(|e| StageError::Delete {
                path: image.path.clone(),
                converted_path: target.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Encodes `source`, then keeps re-encoding the output at decreasing quality
/// while it is above the size threshold, up to the attempt cap.
pub(crate) fn transcode_until_small<E>(
    encoder: &E,
    source: &[u8],
    settings: &EncodeSettings,
) -> Result<Encoded, StageError>
where
    E: ImageEncoder + ?Sized,
{
    let convert_error = |e: crate::encoder::EncoderError| StageError::Convert {
        reason: e.to_string(),
    };

    let mut quality = settings.quality;
    let mut bytes = encoder.encode(source, quality).map_err(convert_error)?;
    let mut attempts = 1;

    while bytes.len() as u64 > settings.max_output_bytes {
        if attempts >= settings.max_attempts {
            return Err(StageError::SizeLimitExceeded {
                size_bytes: bytes.len() as u64,
                limit_bytes: settings.max_output_bytes,
                attempts,
            });
        }

        quality = quality
            .saturating_sub(settings.quality_step)
            .max(settings.min_quality);
        bytes = encoder.reencode(&bytes, quality).map_err(convert_error)?;
        attempts += 1;
        debug!(attempts, quality, size = bytes.len(), "Re-encoded oversized output");
    }

    Ok(Encoded {
        bytes,
        quality,
        attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixtures, MockEncoder, MockObjectStore};

    fn settings(max_output_bytes: u64, max_attempts: u32) -> EncodeSettings {
        EncodeSettings {
            quality: 80,
            min_quality: 10,
            quality_step: 20,
            max_output_bytes,
            max_attempts,
        }
    }

    fn pipeline(store: &MockObjectStore, encoder: &MockEncoder) -> TaskPipeline<MockObjectStore, MockEncoder> {
        TaskPipeline::new(
            Arc::new(store.clone()),
            Arc::new(encoder.clone()),
            &ConverterConfig::default(),
        )
    }

    fn task(path: &str) -> ImageTask {
        ImageTask {
            batch_id: 1,
            image: ImageDescriptor::from_path(path),
            scope: CancellationToken::new(),
        }
    }

    #[test]
    fn test_transcode_single_pass_when_small() {
        let encoder = MockEncoder::new();
        let encoded = transcode_until_small(&encoder, &[7u8; 100], &settings(1000, 5)).unwrap();

        assert_eq!(encoded.attempts, 1);
        assert_eq!(encoded.quality, 80);
        assert_eq!(encoded.bytes.len(), 80);
    }

    #[test]
    fn test_default_settings_keep_small_webp_at_full_resolution() {
        use crate::encoder::WebpEncoder;
        use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
        use std::io::Cursor;

        let source = RgbImage::from_fn(200, 100, |x, y| Rgb([x as u8, y as u8, 90]));
        let mut png = Vec::new();
        DynamicImage::ImageRgb8(source)
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .unwrap();

        let settings = EncodeSettings::from(&ConverterConfig::default());
        let encoded = transcode_until_small(&WebpEncoder::new(), &png, &settings).unwrap();

        assert_eq!(encoded.attempts, 1);
        let decoded = image::load_from_memory(&encoded.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (200, 100));
    }

    #[test]
    fn test_transcode_reencodes_until_under_limit() {
        let encoder = MockEncoder::new();
        // 1000 -> 800 (q80) -> 480 (q60) -> 192 (q40)
        let encoded = transcode_until_small(&encoder, &[7u8; 1000], &settings(200, 5)).unwrap();

        assert_eq!(encoded.attempts, 3);
        assert_eq!(encoded.quality, 40);
        assert_eq!(encoded.bytes.len(), 192);
        assert_eq!(encoder.calls(), vec![(1000, 80), (800, 60), (480, 40)]);
    }

    #[test]
    fn test_transcode_gives_up_after_attempt_cap() {
        let encoder = MockEncoder::new().with_fixed_output_len(5000);
        let err = transcode_until_small(&encoder, &[7u8; 10], &settings(1000, 3)).unwrap_err();

        assert_eq!(
            err,
            StageError::SizeLimitExceeded {
                size_bytes: 5000,
                limit_bytes: 1000,
                attempts: 3,
            }
        );
        assert_eq!(encoder.calls().len(), 3);
    }

    #[test]
    fn test_transcode_quality_never_below_floor() {
        let encoder = MockEncoder::new().with_fixed_output_len(5000);
        let _ = transcode_until_small(&encoder, &[7u8; 10], &settings(1000, 6));

        let qualities: Vec<u8> = encoder.calls().into_iter().map(|(_, q)| q).collect();
        assert_eq!(qualities, vec![80, 60, 40, 20, 10, 10]);
    }

    #[tokio::test]
    async fn test_execute_success_moves_object() {
        let store = MockObjectStore::new();
        store.insert("posts/a.jpg", fixtures::image_bytes(100)).await;
        let encoder = MockEncoder::new();

        let converted = pipeline(&store, &encoder)
            .execute(&task("posts/a.jpg"))
            .await
            .unwrap();

        assert_eq!(converted.path, "posts/a.webp");
        assert_eq!(converted.size_bytes, 75);
        assert_eq!(converted.checksum.len(), 64);
        assert!(store.contains("posts/a.webp").await);
        assert!(!store.contains("posts/a.jpg").await);
        assert!(!store.contains("posts/a.webp.part").await);
    }

    #[tokio::test]
    async fn test_download_failure_touches_nothing_else() {
        let store = MockObjectStore::new();
        let encoder = MockEncoder::new();

        let err = pipeline(&store, &encoder)
            .execute(&task("posts/missing.png"))
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Some(StageCode::Download));
        assert!(encoder.calls().is_empty());
        assert_eq!(store.writes().await, 0);
        assert_eq!(store.deletes().await, 0);
    }

    #[tokio::test]
    async fn test_upload_failure_keeps_original() {
        let store = MockObjectStore::new();
        store.insert("b.png", fixtures::image_bytes(50)).await;
        store.fail_put("b.webp.part").await;
        let encoder = MockEncoder::new();

        let err = pipeline(&store, &encoder)
            .execute(&task("b.png"))
            .await
            .unwrap_err();

        assert!(matches!(err, StageError::Upload { .. }));
        assert!(store.contains("b.png").await);
        assert!(!store.contains("b.webp").await);
    }

    #[tokio::test]
    async fn test_delete_failure_leaves_both_objects() {
        let store = MockObjectStore::new();
        store.insert("c.jpg", fixtures::image_bytes(50)).await;
        store.fail_delete("c.jpg").await;
        let encoder = MockEncoder::new();

        let err = pipeline(&store, &encoder)
            .execute(&task("c.jpg"))
            .await
            .unwrap_err();

        assert!(matches!(err, StageError::Delete { ref converted_path, .. } if converted_path == "c.webp"));
        assert!(store.contains("c.jpg").await);
        assert!(store.contains("c.webp").await);
    }

    #[tokio::test]
    async fn test_in_place_conversion_skips_delete() {
        let store = MockObjectStore::new();
        store.insert("d.webp", fixtures::image_bytes(50)).await;
        let encoder = MockEncoder::new();

        let converted = pipeline(&store, &encoder)
            .execute(&task("d.webp"))
            .await
            .unwrap();

        assert_eq!(converted.path, "d.webp");
        assert!(store.contains("d.webp").await);
        assert_eq!(store.deletes().await, 0);
    }

    #[tokio::test]
    async fn test_cancelled_scope_stops_before_first_stage() {
        let store = MockObjectStore::new();
        store.insert("e.jpg", fixtures::image_bytes(50)).await;
        let encoder = MockEncoder::new();
        let task = task("e.jpg");
        task.scope.cancel();

        let err = pipeline(&store, &encoder).execute(&task).await.unwrap_err();

        assert_eq!(
            err,
            StageError::Cancelled {
                stage: StageCode::Download
            }
        );
        assert!(store.contains("e.jpg").await);
    }

    #[tokio::test]
    async fn test_deadline_interrupts_slow_stage() {
        let store = MockObjectStore::new();
        store.insert("f.jpg", fixtures::image_bytes(50)).await;
        store.set_latency(Duration::from_millis(500)).await;
        let encoder = MockEncoder::new();
        let scope = TaskScope::derive(&CancellationToken::new(), Duration::from_millis(50));

        let err = scope
            .run(StageCode::Download, async {
                store
                    .get("f.jpg")
                    .await
                    .map_err(|e| StageError::Download {
                        path: "f.jpg".to_string(),
                        reason: e.to_string(),
                    })
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StageError::Timeout {
                stage: StageCode::Download,
                ..
            }
        ));
        assert!(encoder.calls().is_empty());
    }
}
