//! Image conversion API handlers.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use imgpress_core::{
    ConverterState, ConverterStatus, ImageDescriptor, ImageEncoder, JobReport, ObjectStore,
    ProgressSnapshot, ServiceError, SubmitError,
};

use crate::metrics::JOBS_REJECTED;
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for starting a conversion job.
///
/// Exactly one of `prefix` and `images` must be given.
#[derive(Debug, Deserialize)]
pub struct ConvertBody {
    /// Convert every eligible object under this prefix.
    pub prefix: Option<String>,
    /// Convert these object paths.
    pub images: Option<Vec<String>>,
}

/// Response for an accepted job
#[derive(Debug, Serialize)]
pub struct ConvertAccepted {
    pub status: &'static str,
    /// Images the job will process.
    pub total: usize,
}

/// Converter status plus the most recent job
#[derive(Debug, Serialize)]
pub struct ConvertStatusResponse {
    pub converter: ConverterStatus,
    pub last_job: Option<JobReport>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ConvertErrorResponse {
    pub error: String,
    /// Machine readable reason.
    pub reason: &'static str,
}

type ApiError = (StatusCode, Json<ConvertErrorResponse>);

fn api_error(status: StatusCode, reason: &'static str, error: impl ToString) -> ApiError {
    (
        status,
        Json(ConvertErrorResponse {
            error: error.to_string(),
            reason,
        }),
    )
}

fn service_error(err: ServiceError) -> ApiError {
    let reason = match &err {
        ServiceError::JobInProgress => "job_in_progress",
        ServiceError::Submit(submit) => submit.reason(),
        ServiceError::Storage(_) => "storage",
    };

    let status = if err.is_busy() {
        StatusCode::CONFLICT
    } else if err.is_unavailable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::BAD_GATEWAY
    };

    if status != StatusCode::BAD_GATEWAY {
        JOBS_REJECTED.with_label_values(&[reason]).inc();
    }
    api_error(status, reason, err)
}

// ============================================================================
// Handlers
// ============================================================================

/// Start a conversion job in the background.
///
/// Responds 202 once the job is reserved; results are reported through
/// the status endpoint and the progress WebSocket.
pub async fn start_conversion<S, E>(
    State(state): State<Arc<AppState<S, E>>>,
    Json(body): Json<ConvertBody>,
) -> Result<(StatusCode, Json<ConvertAccepted>), ApiError>
where
    S: ObjectStore + 'static,
    E: ImageEncoder + 'static,
{
    if state.converter().state() != ConverterState::Running {
        return Err(service_error(ServiceError::Submit(
            SubmitError::ConverterClosed,
        )));
    }

    let permit = state.service().reserve().map_err(service_error)?;

    let images = match (body.prefix, body.images) {
        (Some(prefix), None) => state
            .service()
            .plan_prefix(&prefix)
            .await
            .map_err(service_error)?,
        (None, Some(paths)) => explicit_images(state.converter().encoder(), paths)?,
        _ => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "invalid_body",
                "Exactly one of `prefix` and `images` is required",
            ))
        }
    };

    let total = images.len();
    let service = Arc::clone(state.service());
    let cancel = state.shutdown_token().child_token();
    info!(total, "Accepted conversion job");

    tokio::spawn(async move {
        let report = service.run_job(permit, images, &cancel).await;
        if let Some(error) = &report.error {
            warn!(error = %error, "Conversion job ended early");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(ConvertAccepted {
            status: "accepted",
            total,
        }),
    ))
}

fn explicit_images<E: ImageEncoder>(
    encoder: &E,
    paths: Vec<String>,
) -> Result<Vec<ImageDescriptor>, ApiError> {
    let images: Vec<ImageDescriptor> = paths.into_iter().map(ImageDescriptor::from_path).collect();

    if let Some(unsupported) = images.iter().find(|image| !encoder.accepts(&image.format)) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "unsupported_format",
            format!(
                "Unsupported image format '{}' for {}",
                unsupported.format, unsupported.path
            ),
        ));
    }

    Ok(images)
}

/// Converter status and the last job report
pub async fn get_status<S, E>(State(state): State<Arc<AppState<S, E>>>) -> impl IntoResponse
where
    S: ObjectStore + 'static,
    E: ImageEncoder + 'static,
{
    Json(ConvertStatusResponse {
        converter: state.converter().status(),
        last_job: state.service().last_job().await,
    })
}

/// Progress counters of the current batch
pub async fn get_progress<S, E>(State(state): State<Arc<AppState<S, E>>>) -> Json<ProgressSnapshot>
where
    S: ObjectStore + 'static,
    E: ImageEncoder + 'static,
{
    Json(state.progress().snapshot())
}
