//! Per-job pipeline: stage dispatch by job type plus shared post-processing.

use std::future::Future;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::{JobStore, RecipeRepository, StoreError};
use crate::models::job::{ErrorCode, ExportFormat, JobOptions, JobStatus, JobType};
use crate::models::recipe::ExtractionResult;
use crate::services::cache::ResultCache;
use crate::services::downloader::{Acquisition, DownloadError, Platform, VideoDownloader};
use crate::services::enrichment::RecipeEnricher;
use crate::services::exporter::RecipeExporter;
use crate::services::extractor::{
    ExtractError, ExtractOptions, ImageInput, MediaRef, RecipeExtractor, VideoMetadata,
};
use crate::services::idempotency::content_language;
use crate::services::refine::{refine, NoRecipe};
use crate::services::staging::{StagedFiles, StagingArea};

/// Bound on fire-and-forget side effects (cache write-back, hit counter).
const SIDE_EFFECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the terminal write waits for queued progress updates.
const PROGRESS_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Job was cancelled")]
    Cancelled,

    #[error("Service shutting down")]
    ShuttingDown,

    #[error("Timed out {0}")]
    Timeout(&'static str),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Content is not a recipe: {0}")]
    ContentIrrelevant(String),

    #[error("No recipe found: {0}")]
    NoRecipeFound(String),

    #[error("Upstream temporarily unavailable: {0}")]
    Transient(String),

    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("Failed to save result: {0}")]
    Save(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PipelineError::Cancelled => ErrorCode::Cancelled,
            PipelineError::ShuttingDown | PipelineError::Transient(_) => ErrorCode::TransientFailure,
            PipelineError::Timeout(_) => ErrorCode::Timeout,
            PipelineError::ServiceUnavailable(_) => ErrorCode::ServiceUnavailable,
            PipelineError::ContentIrrelevant(_) => ErrorCode::ContentIrrelevant,
            PipelineError::NoRecipeFound(_) => ErrorCode::NoRecipeFound,
            PipelineError::Extraction(_) => ErrorCode::ExtractionFailed,
            PipelineError::Save(_) => ErrorCode::SaveFailed,
            PipelineError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

impl From<ExtractError> for PipelineError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::NotConfigured => PipelineError::ServiceUnavailable(e.to_string()),
            ExtractError::NotARecipe(reason) => PipelineError::ContentIrrelevant(reason),
            e if e.is_transient() => PipelineError::Transient(e.to_string()),
            e => PipelineError::Extraction(e.to_string()),
        }
    }
}

impl From<DownloadError> for PipelineError {
    fn from(e: DownloadError) -> Self {
        match e {
            DownloadError::Unavailable => PipelineError::ServiceUnavailable(e.to_string()),
            DownloadError::Timeout => PipelineError::Transient(e.to_string()),
            e => PipelineError::Extraction(e.to_string()),
        }
    }
}

impl From<NoRecipe> for PipelineError {
    fn from(e: NoRecipe) -> Self {
        PipelineError::NoRecipeFound(e.0.to_string())
    }
}

/// What a job works on. Image files are owned here and removed when the source is dropped.
#[derive(Debug)]
pub enum JobSource {
    /// Normalized page URL.
    Url { url: String },
    Images { files: StagedFiles },
    /// Normalized video URL.
    Video { url: String },
    Conversion { recipe_id: Uuid, format: ExportFormat },
}

#[derive(Debug)]
pub struct JobSpec {
    pub job_id: Uuid,
    pub owner_id: Uuid,
    pub source: JobSource,
    pub options: JobOptions,
}

impl JobSource {
    pub fn job_type(&self) -> JobType {
        match self {
            JobSource::Url { .. } => JobType::Url,
            JobSource::Images { .. } => JobType::Image,
            JobSource::Video { .. } => JobType::Video,
            JobSource::Conversion { .. } => JobType::Conversion,
        }
    }

    /// Normalized source URL, for sources that have one.
    pub fn source_url(&self) -> Option<&str> {
        match self {
            JobSource::Url { url } | JobSource::Video { url } => Some(url),
            JobSource::Images { .. } | JobSource::Conversion { .. } => None,
        }
    }
}

impl JobSpec {
    pub fn job_type(&self) -> JobType {
        self.source.job_type()
    }
}

/// Successful pipeline output.
#[derive(Debug)]
pub enum Outcome {
    /// `recipe_id` is `None` when the caller opted out of auto-save.
    Recipe {
        recipe_id: Option<Uuid>,
        result: ExtractionResult,
    },
    Export { url: String },
}

struct ProgressUpdate {
    status: JobStatus,
    progress: i32,
    message: String,
}

/// Non-blocking progress sink for one job. Updates are written in order by a
/// forwarder task; progress never moves backwards.
#[derive(Clone)]
pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<ProgressUpdate>,
    last: Arc<AtomicI32>,
}

pub struct ProgressForwarder {
    handle: JoinHandle<()>,
}

impl ProgressReporter {
    pub fn spawn(store: Arc<dyn JobStore>, job_id: Uuid) -> (Self, ProgressForwarder) {
        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressUpdate>();
        let handle = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                if let Err(e) = store
                    .update_progress(job_id, update.status, update.progress, &update.message)
                    .await
                {
                    tracing::warn!(job_id = %job_id, error = %e, "Failed to record progress");
                }
            }
        });
        let reporter = Self {
            tx,
            last: Arc::new(AtomicI32::new(0)),
        };
        (reporter, ProgressForwarder { handle })
    }

    pub fn report(&self, status: JobStatus, progress: u8, message: &str) {
        let progress = i32::from(progress.min(100));
        let previous = self.last.fetch_max(progress, Ordering::Relaxed);
        let _ = self.tx.send(ProgressUpdate {
            status,
            progress: progress.max(previous),
            message: message.to_string(),
        });
    }

    /// Callback for a collaborator, mapping its 0..=100 onto `from..=to` of the job.
    pub fn stage(&self, status: JobStatus, from: u8, to: u8) -> impl Fn(u8, &str) + Send + Sync {
        let reporter = self.clone();
        move |pct: u8, message: &str| {
            let span = u32::from(to.saturating_sub(from));
            let scaled = from as u32 + span * u32::from(pct.min(100)) / 100;
            let scaled = scaled as i32;
            if scaled > reporter.last.load(Ordering::Relaxed) {
                reporter.report(status, scaled as u8, message);
            }
        }
    }
}

impl ProgressForwarder {
    /// Wait until every queued update is written. All reporters must be dropped first.
    pub async fn drain(self) {
        let abort = self.handle.abort_handle();
        if tokio::time::timeout(PROGRESS_DRAIN_TIMEOUT, self.handle).await.is_err() {
            abort.abort();
            tracing::warn!("Progress forwarder did not drain in time");
        }
    }
}

/// Per-run state handed to every stage.
pub struct JobContext {
    pub job_id: Uuid,
    pub owner_id: Uuid,
    pub deadline: Instant,
    pub progress: ProgressReporter,
    token: CancellationToken,
    shutdown: CancellationToken,
}

impl JobContext {
    pub fn new(
        job_id: Uuid,
        owner_id: Uuid,
        token: CancellationToken,
        shutdown: CancellationToken,
        deadline: Instant,
        progress: ProgressReporter,
    ) -> Self {
        Self {
            job_id,
            owner_id,
            deadline,
            progress,
            token,
            shutdown,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Why the job token fired: process shutdown or a cancel request.
    pub fn interruption(&self) -> PipelineError {
        if self.shutdown.is_cancelled() {
            PipelineError::ShuttingDown
        } else {
            PipelineError::Cancelled
        }
    }

    /// Cooperative checkpoint, called between stages and before external I/O.
    pub fn checkpoint(&self) -> Result<(), PipelineError> {
        if self.token.is_cancelled() {
            return Err(self.interruption());
        }
        if Instant::now() >= self.deadline {
            return Err(PipelineError::Timeout("before the job finished"));
        }
        Ok(())
    }
}

/// Run a best-effort side effect in the background with its own timeout. Errors are logged.
pub fn spawn_best_effort<F, E>(what: &'static str, job_id: Uuid, fut: F)
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    tokio::spawn(async move {
        match tokio::time::timeout(SIDE_EFFECT_TIMEOUT, fut).await {
            Ok(Ok(())) => tracing::debug!(job_id = %job_id, what, "Background write done"),
            Ok(Err(e)) => tracing::warn!(job_id = %job_id, what, error = %e, "Background write failed"),
            Err(_) => tracing::warn!(job_id = %job_id, what, "Background write timed out"),
        }
    });
}

/// External collaborators shared by every job.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn JobStore>,
    pub cache: Arc<dyn ResultCache>,
    pub recipes: Arc<dyn RecipeRepository>,
    pub extractor: Arc<dyn RecipeExtractor>,
    pub enricher: Option<Arc<dyn RecipeEnricher>>,
    pub downloader: Arc<dyn VideoDownloader>,
    pub exporter: Arc<dyn RecipeExporter>,
    pub staging: StagingArea,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub enrichment_min_confidence: f64,
    pub native_video_platforms: Vec<String>,
}

struct Extracted {
    result: ExtractionResult,
    /// Normalized source for cache write-back and save-time dedup.
    source_url: Option<String>,
    from_cache: bool,
}

pub struct PipelineExecutor {
    deps: Collaborators,
    settings: PipelineSettings,
}

impl PipelineExecutor {
    pub fn new(deps: Collaborators, settings: PipelineSettings) -> Self {
        Self { deps, settings }
    }

    pub async fn run(&self, spec: JobSpec, ctx: &JobContext) -> Result<Outcome, PipelineError> {
        ctx.checkpoint()?;
        let job_type = spec.job_type();
        let JobSpec { source, options, .. } = spec;

        let extracted = match source {
            JobSource::Url { url } => self.run_url(ctx, url, &options).await?,
            JobSource::Images { files } => self.run_images(ctx, files, &options).await?,
            JobSource::Video { url } => self.run_video(ctx, url, &options).await?,
            JobSource::Conversion { recipe_id, format } => {
                return self.run_conversion(ctx, recipe_id, format).await;
            }
        };

        self.finish(ctx, job_type, extracted, &options).await
    }

    fn extract_options(options: &JobOptions) -> ExtractOptions {
        ExtractOptions {
            language: options.language.clone(),
            detail_level: options.detail_level,
        }
    }

    fn require_extractor(&self) -> Result<(), PipelineError> {
        if self.deps.extractor.is_available() {
            Ok(())
        } else {
            Err(PipelineError::ServiceUnavailable(
                "recipe extractor is not configured".to_string(),
            ))
        }
    }

    /// Cached result for `url`, bumping its hit counter in the background.
    async fn cached(&self, ctx: &JobContext, url: &str, force_refresh: bool) -> Option<Extracted> {
        if force_refresh {
            return None;
        }
        ctx.progress.report(JobStatus::Processing, 5, "Checking cache");

        match self.deps.cache.get_by_normalized_source(url).await {
            Ok(Some(entry)) => {
                metrics::counter!("extraction_cache_hits_total").increment(1);
                tracing::info!(job_id = %ctx.job_id, hits = entry.hit_count, "Serving extraction from cache");

                let cache = Arc::clone(&self.deps.cache);
                let hash = entry.source_hash.clone();
                spawn_best_effort("cache hit count", ctx.job_id, async move {
                    cache.increment_hit_count(&hash).await
                });

                Some(Extracted {
                    result: entry.into_result(),
                    source_url: Some(url.to_string()),
                    from_cache: true,
                })
            }
            Ok(None) => {
                metrics::counter!("extraction_cache_misses_total").increment(1);
                None
            }
            Err(e) => {
                tracing::warn!(job_id = %ctx.job_id, error = %e, "Cache lookup failed, extracting");
                None
            }
        }
    }

    async fn run_url(
        &self,
        ctx: &JobContext,
        url: String,
        options: &JobOptions,
    ) -> Result<Extracted, PipelineError> {
        if let Some(hit) = self.cached(ctx, &url, options.force_refresh).await {
            return Ok(hit);
        }

        ctx.checkpoint()?;
        self.require_extractor()?;
        ctx.progress.report(JobStatus::Processing, 10, "Fetching page");

        let on_progress = ctx.progress.stage(JobStatus::Extracting, 15, 80);
        let result = self
            .deps
            .extractor
            .extract_from_url(&url, &Self::extract_options(options), &on_progress)
            .await?;

        Ok(Extracted {
            result,
            source_url: Some(url),
            from_cache: false,
        })
    }

    async fn run_images(
        &self,
        ctx: &JobContext,
        files: StagedFiles,
        options: &JobOptions,
    ) -> Result<Extracted, PipelineError> {
        ctx.progress.report(JobStatus::Processing, 5, "Reading photos");

        let mut inputs = Vec::with_capacity(files.images().len());
        for staged in files.images() {
            let bytes = tokio::fs::read(&staged.path).await.map_err(|e| {
                PipelineError::Extraction(format!("unreadable image {}: {e}", staged.path.display()))
            })?;
            image::guess_format(&bytes).map_err(|_| {
                PipelineError::Extraction(format!("corrupt image {}", staged.path.display()))
            })?;
            inputs.push(ImageInput {
                bytes,
                mime_type: staged.mime_type.clone(),
            });
        }

        ctx.checkpoint()?;
        self.require_extractor()?;

        let on_progress = ctx.progress.stage(JobStatus::Extracting, 15, 80);
        let result = self
            .deps
            .extractor
            .extract_from_images(&inputs, &Self::extract_options(options), &on_progress)
            .await?;

        // `files` drops here and removes the uploads.
        Ok(Extracted {
            result,
            source_url: None,
            from_cache: false,
        })
    }

    async fn run_video(
        &self,
        ctx: &JobContext,
        url: String,
        options: &JobOptions,
    ) -> Result<Extracted, PipelineError> {
        if let Some(hit) = self.cached(ctx, &url, options.force_refresh).await {
            return Ok(hit);
        }

        ctx.checkpoint()?;
        self.require_extractor()?;

        let platform = Platform::detect(&url);
        let acquisition = platform.acquisition(&self.settings.native_video_platforms);
        let downloader = &self.deps.downloader;

        let metadata = if downloader.is_available() {
            ctx.progress.report(JobStatus::Processing, 8, "Reading video details");
            match downloader.fetch_metadata(&url).await {
                Ok(metadata) => metadata,
                Err(e) => {
                    tracing::warn!(job_id = %ctx.job_id, error = %e, "Video metadata unavailable");
                    VideoMetadata::default()
                }
            }
        } else {
            VideoMetadata::default()
        };
        let label = metadata
            .title
            .as_deref()
            .map(|t| format!("\"{t}\""))
            .unwrap_or_else(|| "video".to_string());

        // Holds downloaded media until this function returns.
        let mut scratch = StagedFiles::default();
        let media = match acquisition {
            Acquisition::Remote => MediaRef::Remote { url: url.clone() },
            Acquisition::Local => {
                if !downloader.is_available() {
                    return Err(PipelineError::ServiceUnavailable(
                        "video downloader is not installed".to_string(),
                    ));
                }
                ctx.checkpoint()?;
                let dir = self.deps.staging.media_dir(ctx.job_id);
                scratch.track(&dir);

                ctx.progress
                    .report(JobStatus::Downloading, 10, &format!("Downloading {label}"));
                let on_progress = ctx.progress.stage(JobStatus::Downloading, 10, 45);
                let media = downloader.download(&url, &dir, &on_progress).await?;
                MediaRef::Local {
                    path: media.path,
                    mime_type: media.mime_type,
                }
            }
        };
        tracing::debug!(job_id = %ctx.job_id, %platform, ?acquisition, "Video acquired");

        ctx.checkpoint()?;
        ctx.progress
            .report(JobStatus::Extracting, 50, &format!("Watching {label}"));
        let on_progress = ctx.progress.stage(JobStatus::Extracting, 50, 80);
        let result = self
            .deps
            .extractor
            .extract_from_video(&media, &metadata, &Self::extract_options(options), &on_progress)
            .await?;

        drop(scratch);
        Ok(Extracted {
            result,
            source_url: Some(url),
            from_cache: false,
        })
    }

    async fn run_conversion(
        &self,
        ctx: &JobContext,
        recipe_id: Uuid,
        format: ExportFormat,
    ) -> Result<Outcome, PipelineError> {
        ctx.progress.report(JobStatus::Processing, 10, "Loading recipe");
        let recipe = self
            .deps
            .recipes
            .get(recipe_id)
            .await
            .map_err(|e| PipelineError::Transient(e.to_string()))?
            .ok_or_else(|| PipelineError::Extraction(format!("recipe {recipe_id} no longer exists")))?;

        ctx.checkpoint()?;
        ctx.progress
            .report(JobStatus::Extracting, 50, &format!("Rendering {format}"));
        let url = self
            .deps
            .exporter
            .export(ctx.job_id, &recipe, format)
            .await
            .map_err(|e| PipelineError::Save(e.to_string()))?;

        Ok(Outcome::Export { url })
    }

    /// Refine, enrich, write back to the cache and save.
    async fn finish(
        &self,
        ctx: &JobContext,
        job_type: JobType,
        extracted: Extracted,
        options: &JobOptions,
    ) -> Result<Outcome, PipelineError> {
        let Extracted {
            result,
            source_url,
            from_cache,
        } = extracted;

        ctx.checkpoint()?;
        ctx.progress.report(JobStatus::Extracting, 82, "Refining recipe");
        let mut result = refine(result)?;
        if result.source_url.is_none() {
            result.source_url = source_url.clone();
        }

        self.enrich(ctx, &mut result, options).await?;

        if job_type.is_cacheable() && !from_cache {
            if let Some(url) = source_url.clone() {
                let cache = Arc::clone(&self.deps.cache);
                let payload = result.clone();
                spawn_best_effort("cache write-back", ctx.job_id, async move {
                    cache.set(&url, &payload).await
                });
            }
        }

        if !options.save_auto {
            return Ok(Outcome::Recipe {
                recipe_id: None,
                result,
            });
        }

        ctx.checkpoint()?;
        ctx.progress.report(JobStatus::Extracting, 95, "Saving recipe");
        let recipe_id = self
            .save(ctx.owner_id, &result, source_url.as_deref(), options)
            .await
            .map_err(|e| PipelineError::Save(e.to_string()))?;

        Ok(Outcome::Recipe {
            recipe_id: Some(recipe_id),
            result,
        })
    }

    async fn enrich(
        &self,
        ctx: &JobContext,
        result: &mut ExtractionResult,
        options: &JobOptions,
    ) -> Result<(), PipelineError> {
        let Some(enricher) = self.deps.enricher.as_ref().filter(|e| e.is_available()) else {
            return Ok(());
        };
        if result.nutrition.is_some() {
            return Ok(());
        }

        ctx.checkpoint()?;
        ctx.progress
            .report(JobStatus::Extracting, 88, "Estimating nutrition");
        let language = result.language.clone().or_else(|| options.language.clone());
        match enricher.enrich(result, language.as_deref()).await {
            Ok(enrichment) => {
                let applied = enrichment.apply(result, self.settings.enrichment_min_confidence);
                tracing::debug!(
                    job_id = %ctx.job_id,
                    nutrition = applied.nutrition,
                    dietary = applied.dietary,
                    "Enrichment applied"
                );
            }
            Err(e) => {
                tracing::warn!(job_id = %ctx.job_id, error = %e, "Enrichment failed, keeping result");
            }
        }
        Ok(())
    }

    /// Reuse the owner's recipe from the same source and content language, else insert.
    async fn save(
        &self,
        owner_id: Uuid,
        result: &ExtractionResult,
        source_url: Option<&str>,
        options: &JobOptions,
    ) -> Result<Uuid, StoreError> {
        let language = content_language(result.language.as_deref(), options.language.as_deref());
        if let Some(url) = source_url {
            if let Some(existing) = self.deps.recipes.find_by_source(owner_id, url, &language).await? {
                tracing::info!(recipe_id = %existing, "Reusing existing recipe from same source");
                return Ok(existing);
            }
        }
        self.deps
            .recipes
            .insert(owner_id, result, source_url, &language)
            .await
    }
}
