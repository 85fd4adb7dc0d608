use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use crate::models::job::{
    DetailLevel, ErrorCode, ExportFormat, ExtractionJob, JobOptions, JobStatus, JobType, NewJob,
    StagedImage,
};
use crate::models::recipe::ExtractionResult;

/// Durable record of job identity, progress and outcome.
///
/// Writes after a terminal status are ignored, so a late progress update can never
/// resurrect a finished job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a pending job. Fails with [`StoreError::DuplicateKey`] when a live job
    /// already holds the same idempotency key for this owner.
    async fn create(&self, job: NewJob) -> Result<ExtractionJob, StoreError>;

    async fn get(&self, job_id: Uuid) -> Result<Option<ExtractionJob>, StoreError>;

    async fn get_by_idempotency_key(
        &self,
        owner_id: Uuid,
        key: &str,
    ) -> Result<Option<ExtractionJob>, StoreError>;

    async fn update_progress(
        &self,
        job_id: Uuid,
        status: JobStatus,
        progress: i32,
        message: &str,
    ) -> Result<(), StoreError>;

    /// Complete with a saved recipe and/or the raw extraction result.
    async fn mark_completed(
        &self,
        job_id: Uuid,
        recipe_id: Option<Uuid>,
        result: Option<&ExtractionResult>,
    ) -> Result<(), StoreError>;

    async fn mark_completed_with_url(&self, job_id: Uuid, url: &str) -> Result<(), StoreError>;

    async fn mark_failed(&self, job_id: Uuid, code: ErrorCode, message: &str)
        -> Result<(), StoreError>;

    async fn mark_cancelled(&self, job_id: Uuid) -> Result<(), StoreError>;

    /// Fail a job whose owning task is gone: it is still non-terminal and was created
    /// before `created_before`. Recorded as `TRANSIENT_FAILURE`. Returns whether the job
    /// was changed.
    async fn fail_orphaned(
        &self,
        job_id: Uuid,
        created_before: DateTime<Utc>,
        message: &str,
    ) -> Result<bool, StoreError>;

    /// [`JobStore::fail_orphaned`] for every job of `job_types`.
    async fn fail_orphaned_before(
        &self,
        job_types: &[JobType],
        created_before: DateTime<Utc>,
        message: &str,
    ) -> Result<u64, StoreError>;

    /// Metered jobs created this calendar month (UTC), excluding unmetered failures.
    async fn count_used_this_month(&self, owner_id: Uuid) -> Result<i64, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("A live job already uses this idempotency key")]
    DuplicateKey,

    #[error("Corrupt job record: {0}")]
    Corrupt(String),
}

const JOB_COLUMNS: &str = r#"
    id, owner_id, job_type, source_url, staged_files, export_recipe_id, export_format,
    language, detail_level, save_auto, force_refresh, idempotency_key, metered, status,
    progress, message, recipe_id, result_url, result_payload, error_code, error_message,
    created_at, completed_at
"#;

const NOT_TERMINAL: &str = "status NOT IN ('completed', 'failed', 'cancelled')";

/// PostgreSQL-backed [`JobStore`].
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_column<T: FromStr>(row: &PgRow, column: &str) -> Result<T, StoreError> {
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|_| StoreError::Corrupt(format!("{column} = {raw:?}")))
}

fn parse_optional_column<T: FromStr>(row: &PgRow, column: &str) -> Result<Option<T>, StoreError> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|r| {
        r.parse()
            .map_err(|_| StoreError::Corrupt(format!("{column} = {r:?}")))
    })
    .transpose()
}

fn job_from_row(row: &PgRow) -> Result<ExtractionJob, StoreError> {
    let staged_files: Json<Vec<StagedImage>> = row.try_get("staged_files")?;
    let result: Option<Json<ExtractionResult>> = row.try_get("result_payload")?;

    Ok(ExtractionJob {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        job_type: parse_column::<JobType>(row, "job_type")?,
        source_url: row.try_get("source_url")?,
        staged_files: staged_files.0,
        export_recipe_id: row.try_get("export_recipe_id")?,
        export_format: parse_optional_column::<ExportFormat>(row, "export_format")?,
        options: JobOptions {
            language: row.try_get("language")?,
            detail_level: parse_column::<DetailLevel>(row, "detail_level")?,
            save_auto: row.try_get("save_auto")?,
            force_refresh: row.try_get("force_refresh")?,
        },
        idempotency_key: row.try_get("idempotency_key")?,
        metered: row.try_get("metered")?,
        status: parse_column::<JobStatus>(row, "status")?,
        progress: row.try_get("progress")?,
        message: row.try_get("message")?,
        recipe_id: row.try_get("recipe_id")?,
        result_url: row.try_get("result_url")?,
        result: result.map(|r| r.0),
        error_code: parse_optional_column::<ErrorCode>(row, "error_code")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, job: NewJob) -> Result<ExtractionJob, StoreError> {
        let mut tx = self.pool.begin().await?;

        // A finished job keeps its key only until the next admission supersedes it.
        if let Some(key) = &job.idempotency_key {
            sqlx::query(
                r#"
                UPDATE extraction_jobs
                SET idempotency_key = NULL, updated_at = NOW()
                WHERE owner_id = $1
                  AND idempotency_key = $2
                  AND status IN ('completed', 'failed', 'cancelled')
                "#,
            )
            .bind(job.owner_id)
            .bind(key)
            .execute(&mut *tx)
            .await?;
        }

        let sql = format!(
            r#"
            INSERT INTO extraction_jobs (
                owner_id, job_type, source_url, staged_files, export_recipe_id, export_format,
                language, detail_level, save_auto, force_refresh, idempotency_key, metered
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(job.owner_id)
            .bind(job.job_type.to_string())
            .bind(&job.source_url)
            .bind(Json(&job.staged_files))
            .bind(job.export_recipe_id)
            .bind(job.export_format.map(|f| f.to_string()))
            .bind(&job.options.language)
            .bind(job.options.detail_level.to_string())
            .bind(job.options.save_auto)
            .bind(job.options.force_refresh)
            .bind(&job.idempotency_key)
            .bind(job.metered)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.is_unique_violation() => StoreError::DuplicateKey,
                other => StoreError::Database(other),
            })?;

        let created = job_from_row(&row)?;
        tx.commit().await?;
        Ok(created)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<ExtractionJob>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM extraction_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn get_by_idempotency_key(
        &self,
        owner_id: Uuid,
        key: &str,
    ) -> Result<Option<ExtractionJob>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM extraction_jobs WHERE owner_id = $1 AND idempotency_key = $2"
        );
        let row = sqlx::query(&sql)
            .bind(owner_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn update_progress(
        &self,
        job_id: Uuid,
        status: JobStatus,
        progress: i32,
        message: &str,
    ) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            UPDATE extraction_jobs
            SET status = $2, progress = $3, message = $4, updated_at = NOW()
            WHERE id = $1 AND {NOT_TERMINAL}
            "#
        );
        sqlx::query(&sql)
            .bind(job_id)
            .bind(status.to_string())
            .bind(progress.clamp(0, 100))
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_completed(
        &self,
        job_id: Uuid,
        recipe_id: Option<Uuid>,
        result: Option<&ExtractionResult>,
    ) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            UPDATE extraction_jobs
            SET status = 'completed', progress = 100, message = 'Done',
                recipe_id = $2, result_payload = $3,
                updated_at = NOW(), completed_at = NOW()
            WHERE id = $1 AND {NOT_TERMINAL}
            "#
        );
        sqlx::query(&sql)
            .bind(job_id)
            .bind(recipe_id)
            .bind(result.map(Json))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_completed_with_url(&self, job_id: Uuid, url: &str) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            UPDATE extraction_jobs
            SET status = 'completed', progress = 100, message = 'Done',
                result_url = $2, updated_at = NOW(), completed_at = NOW()
            WHERE id = $1 AND {NOT_TERMINAL}
            "#
        );
        sqlx::query(&sql)
            .bind(job_id)
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        job_id: Uuid,
        code: ErrorCode,
        message: &str,
    ) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            UPDATE extraction_jobs
            SET status = 'failed', error_code = $2, error_message = $3,
                updated_at = NOW(), completed_at = NOW()
            WHERE id = $1 AND {NOT_TERMINAL}
            "#
        );
        sqlx::query(&sql)
            .bind(job_id)
            .bind(code.to_string())
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_cancelled(&self, job_id: Uuid) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            UPDATE extraction_jobs
            SET status = 'cancelled', error_code = $2, error_message = 'Cancelled by request',
                updated_at = NOW(), completed_at = NOW()
            WHERE id = $1 AND {NOT_TERMINAL}
            "#
        );
        sqlx::query(&sql)
            .bind(job_id)
            .bind(ErrorCode::Cancelled.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail_orphaned(
        &self,
        job_id: Uuid,
        created_before: DateTime<Utc>,
        message: &str,
    ) -> Result<bool, StoreError> {
        let sql = format!(
            r#"
            UPDATE extraction_jobs
            SET status = 'failed', error_code = $3, error_message = $4,
                updated_at = NOW(), completed_at = NOW()
            WHERE id = $1 AND created_at < $2 AND {NOT_TERMINAL}
            "#
        );
        let result = sqlx::query(&sql)
            .bind(job_id)
            .bind(created_before)
            .bind(ErrorCode::TransientFailure.to_string())
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn fail_orphaned_before(
        &self,
        job_types: &[JobType],
        created_before: DateTime<Utc>,
        message: &str,
    ) -> Result<u64, StoreError> {
        let types: Vec<String> = job_types.iter().map(|t| t.to_string()).collect();
        let sql = format!(
            r#"
            UPDATE extraction_jobs
            SET status = 'failed', error_code = $3, error_message = $4,
                updated_at = NOW(), completed_at = NOW()
            WHERE job_type = ANY($1) AND created_at < $2 AND {NOT_TERMINAL}
            "#
        );
        let result = sqlx::query(&sql)
            .bind(&types)
            .bind(created_before)
            .bind(ErrorCode::TransientFailure.to_string())
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count_used_this_month(&self, owner_id: Uuid) -> Result<i64, StoreError> {
        let unmetered: Vec<String> = ErrorCode::UNMETERED.iter().map(|c| c.to_string()).collect();
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS used
            FROM extraction_jobs
            WHERE owner_id = $1
              AND metered
              AND created_at >= date_trunc('month', NOW() AT TIME ZONE 'UTC') AT TIME ZONE 'UTC'
              AND (error_code IS NULL OR error_code <> ALL($2))
            "#,
        )
        .bind(owner_id)
        .bind(&unmetered)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("used")?)
    }
}
