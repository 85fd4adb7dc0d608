use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use image::ImageFormat;
use std::str::FromStr;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::job::{DetailLevel, ErrorCode, JobOptions};
use crate::models::request::{
    AdmitResponse, ExportRequest, ExtractRequest, ImageUploadOptions, UrlSourceKind,
};
use crate::routes::ApiError;
use crate::services::idempotency::content_hash;
use crate::services::orchestrator::{Admission, AdmitRequest, RequestSource};
use crate::services::quota::Caller;
use crate::services::staging::StagedFiles;

/// Photos accepted per image job (multi-page cards, several shots of a book page).
const MAX_IMAGES: usize = 10;

fn admitted(admission: Admission) -> (StatusCode, Json<AdmitResponse>) {
    let status = if admission.deduplicated {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    (
        status,
        Json(AdmitResponse {
            job_id: admission.job_id,
            status: admission.status,
            deduplicated: admission.deduplicated,
        }),
    )
}

/// POST /api/v1/extract: Extract a recipe from a web page or a video URL.
pub async fn submit_extraction(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<ExtractRequest>,
) -> Result<(StatusCode, Json<AdmitResponse>), ApiError> {
    req.validate()?;

    let options = JobOptions {
        language: req.language,
        detail_level: req.detail_level,
        save_auto: req.save_auto,
        force_refresh: req.force_refresh,
    };
    let source = match req.kind {
        UrlSourceKind::Url => RequestSource::Url { url: req.url },
        UrlSourceKind::Video => RequestSource::Video { url: req.url },
    };

    let admission = state
        .orchestrator
        .admit(caller, AdmitRequest { source, options })
        .await?;
    Ok(admitted(admission))
}

/// POST /api/v1/extract/images: Extract one recipe from uploaded photos.
///
/// Multipart fields: one or more `image` parts, plus optional `language`,
/// `detail_level`, `save_auto` and `force_refresh`.
pub async fn submit_images(
    State(state): State<AppState>,
    caller: Caller,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<AdmitResponse>), ApiError> {
    let mut images: Vec<(Vec<u8>, ImageFormat)> = Vec::new();
    let mut options = ImageUploadOptions::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::validation(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                if images.len() == MAX_IMAGES {
                    return Err(ApiError::validation(format!("at most {MAX_IMAGES} images per job")));
                }
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::validation(e.to_string()))?;
                let format = image::guess_format(&data)
                    .ok()
                    .filter(|f| matches!(f, ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP))
                    .ok_or_else(|| {
                        ApiError::new(
                            StatusCode::UNSUPPORTED_MEDIA_TYPE,
                            ErrorCode::Validation,
                            "images must be JPEG, PNG or WebP",
                        )
                    })?;
                images.push((data.to_vec(), format));
            }
            "language" | "detail_level" | "save_auto" | "force_refresh" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::validation(e.to_string()))?;
                apply_option(&mut options, &name, value.trim())?;
            }
            _ => {}
        }
    }

    if images.is_empty() {
        return Err(ApiError::validation("at least one image is required"));
    }
    options.validate()?;

    let hash = content_hash(images.iter().map(|(bytes, _)| bytes.as_slice()));
    let mut files = StagedFiles::default();
    for (bytes, format) in &images {
        let staged = state
            .staging
            .stage_image(bytes, format.to_mime_type())
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to stage upload");
                ApiError::internal("Failed to store upload")
            })?;
        files.push(staged);
    }

    let request = AdmitRequest {
        source: RequestSource::Images {
            files,
            content_hash: hash,
        },
        options: JobOptions {
            language: options.language,
            detail_level: options.detail_level,
            save_auto: options.save_auto.unwrap_or(true),
            force_refresh: options.force_refresh,
        },
    };
    let admission = state.orchestrator.admit(caller, request).await?;
    Ok(admitted(admission))
}

fn apply_option(options: &mut ImageUploadOptions, name: &str, value: &str) -> Result<(), ApiError> {
    let invalid = || ApiError::validation(format!("invalid value for {name}"));
    match name {
        "language" => options.language = Some(value.to_string()).filter(|v| !v.is_empty()),
        "detail_level" => options.detail_level = DetailLevel::from_str(value).map_err(|_| invalid())?,
        "save_auto" => options.save_auto = Some(value.parse().map_err(|_| invalid())?),
        "force_refresh" => options.force_refresh = value.parse().map_err(|_| invalid())?,
        _ => {}
    }
    Ok(())
}

/// POST /api/v1/recipes/{recipe_id}/export: Render a saved recipe to a file.
pub async fn export_recipe(
    State(state): State<AppState>,
    caller: Caller,
    Path(recipe_id): Path<Uuid>,
    Json(req): Json<ExportRequest>,
) -> Result<(StatusCode, Json<AdmitResponse>), ApiError> {
    let request = AdmitRequest {
        source: RequestSource::Conversion {
            recipe_id,
            format: req.format,
        },
        options: JobOptions::default(),
    };
    let admission = state.orchestrator.admit(caller, request).await?;
    Ok(admitted(admission))
}
