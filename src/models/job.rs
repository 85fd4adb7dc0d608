use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::recipe::ExtractionResult;

/// Status of an extraction job.
///
/// `pending -> {downloading | processing} -> extracting -> completed | failed | cancelled`.
/// `downloading` is only used by video jobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Downloading,
    Processing,
    Extracting,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const TERMINAL: [JobStatus; 3] = [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }
}

/// Source type of a job. Closed set; dispatch is by `match`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobType {
    Url,
    Image,
    Video,
    /// Format conversion of an already saved recipe; completes with a result URL.
    Conversion,
}

impl JobType {
    pub const ALL: [JobType; 4] = [JobType::Url, JobType::Image, JobType::Video, JobType::Conversion];

    /// Heavy jobs get their own, narrower concurrency gate.
    pub fn weight(self) -> JobWeight {
        match self {
            JobType::Video => JobWeight::Heavy,
            JobType::Url | JobType::Image | JobType::Conversion => JobWeight::Light,
        }
    }

    /// Whether the job counts against the caller's monthly quota.
    pub fn is_metered(self) -> bool {
        !matches!(self, JobType::Conversion)
    }

    /// Whether results of this type are keyed by a stable external source identity.
    pub fn is_cacheable(self) -> bool {
        matches!(self, JobType::Url | JobType::Video)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum JobWeight {
    Heavy,
    Light,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DetailLevel {
    Brief,
    #[default]
    Standard,
    Detailed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExportFormat {
    JsonLd,
    Text,
}

/// Machine-readable failure codes surfaced on failed jobs and rejected admissions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Validation,
    QuotaExceeded,
    ServiceUnavailable,
    Timeout,
    Cancelled,
    ContentIrrelevant,
    NoRecipeFound,
    TransientFailure,
    ExtractionFailed,
    SaveFailed,
    InternalError,
}

impl ErrorCode {
    /// Failures with these codes are not charged against the caller's quota.
    pub const UNMETERED: [ErrorCode; 2] = [ErrorCode::TransientFailure, ErrorCode::ServiceUnavailable];
}

/// A locally staged upload referenced by an image job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StagedImage {
    pub path: std::path::PathBuf,
    pub mime_type: String,
}

/// Caller-selected options carried by every job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobOptions {
    pub language: Option<String>,
    pub detail_level: DetailLevel,
    pub save_auto: bool,
    pub force_refresh: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            language: None,
            detail_level: DetailLevel::Standard,
            save_auto: true,
            force_refresh: false,
        }
    }
}

/// Insert payload for a new job record.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub owner_id: Uuid,
    pub job_type: JobType,
    pub source_url: Option<String>,
    pub staged_files: Vec<StagedImage>,
    pub export_recipe_id: Option<Uuid>,
    pub export_format: Option<ExportFormat>,
    pub options: JobOptions,
    pub idempotency_key: Option<String>,
    /// Counts towards the owner's monthly usage unless it fails with an unmetered code.
    pub metered: bool,
}

/// A persisted extraction job.
///
/// Only status, progress, message, result and error fields change after creation,
/// and only the task that owns the job writes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionJob {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub job_type: JobType,
    pub source_url: Option<String>,
    pub staged_files: Vec<StagedImage>,
    pub export_recipe_id: Option<Uuid>,
    pub export_format: Option<ExportFormat>,
    pub options: JobOptions,
    pub idempotency_key: Option<String>,
    pub metered: bool,
    pub status: JobStatus,
    pub progress: i32,
    pub message: Option<String>,
    pub recipe_id: Option<Uuid>,
    pub result_url: Option<String>,
    pub result: Option<ExtractionResult>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExtractionJob {
    pub fn from_new(id: Uuid, new: NewJob, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            owner_id: new.owner_id,
            job_type: new.job_type,
            source_url: new.source_url,
            staged_files: new.staged_files,
            export_recipe_id: new.export_recipe_id,
            export_format: new.export_format,
            options: new.options,
            idempotency_key: new.idempotency_key,
            metered: new.metered,
            status: JobStatus::Pending,
            progress: 0,
            message: None,
            recipe_id: None,
            result_url: None,
            result: None,
            error_code: None,
            error_message: None,
            created_at,
            completed_at: None,
        }
    }

    /// A completed job whose output can be handed back without new work.
    pub fn has_result(&self) -> bool {
        self.status == JobStatus::Completed
            && (self.recipe_id.is_some() || self.result_url.is_some() || self.result.is_some())
    }
}
