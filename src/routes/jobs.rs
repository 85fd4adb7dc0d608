use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::job::JobStatus;
use crate::models::request::JobStatusResponse;
use crate::routes::ApiError;
use crate::services::quota::Caller;

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: Uuid,
    /// Status at the time of the request; the job applies the cancel at its next checkpoint.
    pub status: JobStatus,
    pub cancel_requested: bool,
}

/// GET /api/v1/jobs/{job_id}: Poll a job.
pub async fn get_job_status(
    State(state): State<AppState>,
    caller: Caller,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job = state.orchestrator.get_status(caller, job_id).await?;
    Ok(Json(job.into()))
}

/// POST /api/v1/jobs/{job_id}/cancel: Request cancellation on whichever instance runs the job.
pub async fn cancel_job(
    State(state): State<AppState>,
    caller: Caller,
    Path(job_id): Path<Uuid>,
) -> Result<(StatusCode, Json<CancelResponse>), ApiError> {
    let status = state.orchestrator.cancel(caller, job_id).await?;
    let cancel_requested = !status.is_terminal();
    let code = if cancel_requested {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((
        code,
        Json(CancelResponse {
            job_id,
            status,
            cancel_requested,
        }),
    ))
}
