use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{
    DetailLevel, ErrorCode, ExportFormat, ExtractionJob, JobStatus, JobType,
};
use crate::models::recipe::ExtractionResult;

/// Source kinds accepted by the JSON extraction endpoint.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UrlSourceKind {
    Url,
    Video,
}

/// Request body for `POST /api/v1/extract`.
#[derive(Debug, Deserialize, Validate)]
pub struct ExtractRequest {
    #[serde(rename = "type")]
    #[garde(skip)]
    pub kind: UrlSourceKind,

    #[garde(url, length(max = 2048))]
    pub url: String,

    #[serde(default)]
    #[garde(length(min = 2, max = 8))]
    pub language: Option<String>,

    #[serde(default)]
    #[garde(skip)]
    pub detail_level: DetailLevel,

    #[serde(default = "default_true")]
    #[garde(skip)]
    pub save_auto: bool,

    #[serde(default)]
    #[garde(skip)]
    pub force_refresh: bool,
}

/// Option fields that accompany an image upload.
#[derive(Debug, Default, Validate)]
pub struct ImageUploadOptions {
    #[garde(length(min = 2, max = 8))]
    pub language: Option<String>,

    #[garde(skip)]
    pub detail_level: DetailLevel,

    #[garde(skip)]
    pub save_auto: Option<bool>,

    #[garde(skip)]
    pub force_refresh: bool,
}

/// Request body for `POST /api/v1/recipes/{recipe_id}/export`.
#[derive(Debug, Deserialize, Validate)]
pub struct ExportRequest {
    #[garde(skip)]
    pub format: ExportFormat,
}

fn default_true() -> bool {
    true
}

/// Response after admitting a job.
#[derive(Debug, Serialize)]
pub struct AdmitResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    /// True when the request resolved to an existing job.
    pub deduplicated: bool,
}

/// Response for querying job status.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress: i32,
    pub message: Option<String>,
    pub recipe_id: Option<Uuid>,
    pub result_url: Option<String>,
    pub result: Option<ExtractionResult>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
}

impl From<ExtractionJob> for JobStatusResponse {
    fn from(job: ExtractionJob) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type,
            status: job.status,
            progress: job.progress,
            message: job.message,
            recipe_id: job.recipe_id,
            result_url: job.result_url,
            result: job.result,
            error_code: job.error_code,
            error_message: job.error_message,
        }
    }
}
