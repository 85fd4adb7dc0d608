use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::models::job::DetailLevel;
use crate::models::recipe::ExtractionResult;

/// Progress callback handed to collaborators: percentage within the current stage
/// and a human-readable message. Must not block.
pub type ProgressFn = dyn Fn(u8, &str) + Send + Sync;

#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    pub language: Option<String>,
    pub detail_level: DetailLevel,
}

#[derive(Debug, Clone)]
pub struct ImageInput {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// What the extractor receives for a video: the canonical URL for platforms the model
/// reads natively, or a locally downloaded media file.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaRef {
    Remote { url: String },
    Local { path: PathBuf, mime_type: String },
}

/// Best-effort video metadata, used for progress messages and as extra context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub uploader: Option<String>,
    pub duration_secs: Option<f64>,
    pub thumbnail_url: Option<String>,
}

/// The AI extractor. Internals are a black box to the pipeline.
#[async_trait]
pub trait RecipeExtractor: Send + Sync {
    fn is_available(&self) -> bool;

    async fn extract_from_url(
        &self,
        url: &str,
        options: &ExtractOptions,
        progress: &ProgressFn,
    ) -> Result<ExtractionResult, ExtractError>;

    /// One recipe from one or more photos (multi-page cards, several shots of a book).
    async fn extract_from_images(
        &self,
        images: &[ImageInput],
        options: &ExtractOptions,
        progress: &ProgressFn,
    ) -> Result<ExtractionResult, ExtractError>;

    async fn extract_from_video(
        &self,
        media: &MediaRef,
        metadata: &VideoMetadata,
        options: &ExtractOptions,
        progress: &ProgressFn,
    ) -> Result<ExtractionResult, ExtractError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("AI extractor is not configured")]
    NotConfigured,

    #[error("Rate limited by upstream: {0}")]
    RateLimited(String),

    #[error("Upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Source is not a recipe: {0}")]
    NotARecipe(String),

    #[error("Failed to parse AI response: {0}")]
    Parse(String),

    #[error("Unusable media: {0}")]
    Media(String),
}

impl ExtractError {
    /// Upstream capacity or availability problems; safe to retry, not charged to quota.
    pub fn is_transient(&self) -> bool {
        match self {
            ExtractError::RateLimited(_) => true,
            ExtractError::Upstream { status, .. } => *status == 429 || *status >= 500,
            ExtractError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status()
                        .is_some_and(|s| s.as_u16() == 429 || s.is_server_error())
            }
            ExtractError::NotConfigured
            | ExtractError::NotARecipe(_)
            | ExtractError::Parse(_)
            | ExtractError::Media(_) => false,
        }
    }
}
