//! In-memory collaborators for driving the orchestrator without Postgres, Redis or Workers AI.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use recipe_extract::db::{JobStore, RecipeRepository, StoreError};
use recipe_extract::models::job::{
    ErrorCode, ExportFormat, ExtractionJob, JobOptions, JobStatus, JobType, NewJob,
};
use recipe_extract::models::recipe::{
    CachedExtraction, ExtractionResult, Ingredient, Nutrition, StoredRecipe,
};
use recipe_extract::services::cache::{CacheError, ResultCache};
use recipe_extract::services::cancellation::{run_listener, Backoff, CancelChannel, LocalCancelChannel};
use recipe_extract::services::downloader::{DownloadError, DownloadedMedia, VideoDownloader};
use recipe_extract::services::enrichment::{Enrichment, RecipeEnricher, Scored};
use recipe_extract::services::exporter::{ExportError, RecipeExporter};
use recipe_extract::services::extractor::{
    ExtractError, ExtractOptions, ImageInput, MediaRef, ProgressFn, RecipeExtractor, VideoMetadata,
};
use recipe_extract::services::idempotency::{normalize_url, source_hash, source_key};
use recipe_extract::services::orchestrator::{
    AdmitRequest, Orchestrator, OrchestratorSettings, RequestSource,
};
use recipe_extract::services::pipeline::{Collaborators, PipelineSettings};
use recipe_extract::services::quota::{Caller, QuotaPolicy, Tier};
use recipe_extract::services::staging::StagingArea;

// ---------------------------------------------------------------------------
// Job store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeJobStore {
    jobs: Mutex<HashMap<Uuid, ExtractionJob>>,
    /// Every status written for a job, in order, including the terminal one.
    transitions: Mutex<HashMap<Uuid, Vec<JobStatus>>>,
    pub creates: AtomicUsize,
}

impl FakeJobStore {
    pub fn job(&self, job_id: Uuid) -> Option<ExtractionJob> {
        self.jobs.lock().unwrap().get(&job_id).cloned()
    }

    pub fn transitions(&self, job_id: Uuid) -> Vec<JobStatus> {
        self.transitions
            .lock()
            .unwrap()
            .get(&job_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    /// Insert a job as another instance would have left it.
    pub fn seed(&self, new: NewJob, status: JobStatus, created_at: DateTime<Utc>) -> Uuid {
        let mut job = ExtractionJob::from_new(Uuid::new_v4(), new, created_at);
        job.status = status;
        let id = job.id;
        self.jobs.lock().unwrap().insert(id, job);
        self.record(id, status);
        id
    }

    fn fail_orphan(job: &mut ExtractionJob, message: &str) {
        job.status = JobStatus::Failed;
        job.error_code = Some(ErrorCode::TransientFailure);
        job.error_message = Some(message.to_string());
        job.completed_at = Some(Utc::now());
    }

    fn record(&self, job_id: Uuid, status: JobStatus) {
        let mut transitions = self.transitions.lock().unwrap();
        let entry = transitions.entry(job_id).or_default();
        if entry.last() != Some(&status) {
            entry.push(status);
        }
    }

    /// Apply `f` to a non-terminal job. Returns false when the job is missing or finished.
    fn update(&self, job_id: Uuid, f: impl FnOnce(&mut ExtractionJob)) -> bool {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(&job_id) else {
            return false;
        };
        if job.status.is_terminal() {
            return false;
        }
        f(job);
        let status = job.status;
        drop(jobs);
        self.record(job_id, status);
        true
    }

    fn finish(&self, job_id: Uuid, f: impl FnOnce(&mut ExtractionJob)) {
        self.update(job_id, |job| {
            f(job);
            job.completed_at = Some(Utc::now());
        });
    }
}

#[async_trait]
impl JobStore for FakeJobStore {
    async fn create(&self, new: NewJob) -> Result<ExtractionJob, StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(key) = &new.idempotency_key {
            for job in jobs.values_mut() {
                if job.owner_id == new.owner_id && job.idempotency_key.as_ref() == Some(key) {
                    if job.status.is_terminal() {
                        job.idempotency_key = None;
                    } else {
                        return Err(StoreError::DuplicateKey);
                    }
                }
            }
        }
        let job = ExtractionJob::from_new(Uuid::new_v4(), new, Utc::now());
        jobs.insert(job.id, job.clone());
        drop(jobs);
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.record(job.id, JobStatus::Pending);
        Ok(job)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<ExtractionJob>, StoreError> {
        Ok(self.job(job_id))
    }

    async fn get_by_idempotency_key(
        &self,
        owner_id: Uuid,
        key: &str,
    ) -> Result<Option<ExtractionJob>, StoreError> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .values()
            .find(|j| j.owner_id == owner_id && j.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn update_progress(
        &self,
        job_id: Uuid,
        status: JobStatus,
        progress: i32,
        message: &str,
    ) -> Result<(), StoreError> {
        self.update(job_id, |job| {
            job.status = status;
            job.progress = progress;
            job.message = Some(message.to_string());
        });
        Ok(())
    }

    async fn mark_completed(
        &self,
        job_id: Uuid,
        recipe_id: Option<Uuid>,
        result: Option<&ExtractionResult>,
    ) -> Result<(), StoreError> {
        self.finish(job_id, |job| {
            job.status = JobStatus::Completed;
            job.progress = 100;
            job.recipe_id = recipe_id;
            job.result = result.cloned();
        });
        Ok(())
    }

    async fn mark_completed_with_url(&self, job_id: Uuid, url: &str) -> Result<(), StoreError> {
        self.finish(job_id, |job| {
            job.status = JobStatus::Completed;
            job.progress = 100;
            job.result_url = Some(url.to_string());
        });
        Ok(())
    }

    async fn mark_failed(
        &self,
        job_id: Uuid,
        code: ErrorCode,
        message: &str,
    ) -> Result<(), StoreError> {
        self.finish(job_id, |job| {
            job.status = JobStatus::Failed;
            job.error_code = Some(code);
            job.error_message = Some(message.to_string());
        });
        Ok(())
    }

    async fn mark_cancelled(&self, job_id: Uuid) -> Result<(), StoreError> {
        self.finish(job_id, |job| {
            job.status = JobStatus::Cancelled;
            job.error_code = Some(ErrorCode::Cancelled);
        });
        Ok(())
    }

    async fn fail_orphaned(
        &self,
        job_id: Uuid,
        created_before: DateTime<Utc>,
        message: &str,
    ) -> Result<bool, StoreError> {
        let stale = self
            .job(job_id)
            .is_some_and(|job| job.created_at < created_before);
        Ok(stale && self.update(job_id, |job| Self::fail_orphan(job, message)))
    }

    async fn fail_orphaned_before(
        &self,
        job_types: &[JobType],
        created_before: DateTime<Utc>,
        message: &str,
    ) -> Result<u64, StoreError> {
        let stale: Vec<Uuid> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| job_types.contains(&j.job_type) && j.created_at < created_before)
            .map(|j| j.id)
            .collect();
        let failed = stale
            .into_iter()
            .filter(|id| self.update(*id, |job| Self::fail_orphan(job, message)))
            .count();
        Ok(failed as u64)
    }

    async fn count_used_this_month(&self, owner_id: Uuid) -> Result<i64, StoreError> {
        let used = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.owner_id == owner_id && j.metered)
            .filter(|j| !j.error_code.is_some_and(|c| ErrorCode::UNMETERED.contains(&c)))
            .count();
        Ok(used as i64)
    }
}

// ---------------------------------------------------------------------------
// Result cache
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeCache {
    entries: Mutex<HashMap<String, CachedExtraction>>,
    pub sets: AtomicUsize,
}

impl FakeCache {
    pub fn hit_count(&self, normalized_url: &str) -> Option<i64> {
        self.entries
            .lock()
            .unwrap()
            .get(&source_hash(normalized_url))
            .map(|e| e.hit_count)
    }
}

#[async_trait]
impl ResultCache for FakeCache {
    async fn get_by_normalized_source(
        &self,
        normalized_url: &str,
    ) -> Result<Option<CachedExtraction>, CacheError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .get(&source_hash(normalized_url))
            .cloned())
    }

    async fn set(&self, normalized_url: &str, payload: &ExtractionResult) -> Result<(), CacheError> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        let hash = source_hash(normalized_url);
        let mut entries = self.entries.lock().unwrap();
        let hits = entries.get(&hash).map(|e| e.hit_count).unwrap_or(0);
        entries.insert(
            hash.clone(),
            CachedExtraction {
                source_hash: hash,
                payload: payload.clone(),
                hit_count: hits,
                cached_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn increment_hit_count(&self, source_hash: &str) -> Result<(), CacheError> {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(source_hash) {
            entry.hit_count += 1;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Recipe repository
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeRecipes {
    recipes: Mutex<HashMap<Uuid, StoredRecipe>>,
    pub inserts: AtomicUsize,
}

impl FakeRecipes {
    pub fn count_for(&self, owner_id: Uuid) -> usize {
        self.recipes
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.owner_id == owner_id)
            .count()
    }

    pub fn add(&self, owner_id: Uuid, source_url: Option<&str>, language: &str, is_public: bool) -> Uuid {
        let recipe = StoredRecipe {
            id: Uuid::new_v4(),
            owner_id,
            source_url: source_url.map(str::to_string),
            language: language.to_string(),
            is_public,
            recipe: sample_recipe(),
            created_at: Utc::now(),
        };
        let id = recipe.id;
        self.recipes.lock().unwrap().insert(id, recipe);
        id
    }
}

#[async_trait]
impl RecipeRepository for FakeRecipes {
    async fn find_by_source(
        &self,
        owner_id: Uuid,
        source_url: &str,
        language: &str,
    ) -> Result<Option<Uuid>, StoreError> {
        Ok(self
            .recipes
            .lock()
            .unwrap()
            .values()
            .find(|r| {
                r.owner_id == owner_id
                    && r.source_url.as_deref() == Some(source_url)
                    && r.language == language
            })
            .map(|r| r.id))
    }

    async fn insert(
        &self,
        owner_id: Uuid,
        recipe: &ExtractionResult,
        source_url: Option<&str>,
        language: &str,
    ) -> Result<Uuid, StoreError> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        let stored = StoredRecipe {
            id: Uuid::new_v4(),
            owner_id,
            source_url: source_url.map(str::to_string),
            language: language.to_string(),
            is_public: false,
            recipe: recipe.clone(),
            created_at: Utc::now(),
        };
        let id = stored.id;
        self.recipes.lock().unwrap().insert(id, stored);
        Ok(id)
    }

    async fn find_shared_by_source(
        &self,
        source_url: &str,
        language: &str,
    ) -> Result<Option<Uuid>, StoreError> {
        Ok(self
            .recipes
            .lock()
            .unwrap()
            .values()
            .find(|r| r.is_public && r.source_url.as_deref() == Some(source_url) && r.language == language)
            .map(|r| r.id))
    }

    async fn clone_for_owner(&self, recipe_id: Uuid, owner_id: Uuid) -> Result<Uuid, StoreError> {
        let mut recipes = self.recipes.lock().unwrap();
        let original = recipes
            .get(&recipe_id)
            .cloned()
            .ok_or_else(|| StoreError::Corrupt(format!("no recipe {recipe_id}")))?;
        let copy = StoredRecipe {
            id: Uuid::new_v4(),
            owner_id,
            is_public: false,
            ..original
        };
        let id = copy.id;
        recipes.insert(id, copy);
        Ok(id)
    }

    async fn get(&self, recipe_id: Uuid) -> Result<Option<StoredRecipe>, StoreError> {
        Ok(self.recipes.lock().unwrap().get(&recipe_id).cloned())
    }
}

// ---------------------------------------------------------------------------
// AI extractor / enricher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed(ExtractionResult),
    RateLimited,
    NotARecipe,
    Empty,
    Panic,
}

pub struct FakeExtractor {
    behavior: Mutex<Behavior>,
    delay: Mutex<Duration>,
    pub available: AtomicBool,
    pub calls: AtomicUsize,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub last_media: Mutex<Option<MediaRef>>,
}

impl Default for FakeExtractor {
    fn default() -> Self {
        Self {
            behavior: Mutex::new(Behavior::Succeed(sample_recipe())),
            delay: Mutex::new(Duration::ZERO),
            available: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            last_media: Mutex::new(None),
        }
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeExtractor {
    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn respond(&self, progress: &ProgressFn) -> Result<ExtractionResult, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        let _active = ActiveGuard(&self.active);

        progress(10, "Reading");
        let delay = *self.delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        progress(100, "Done");

        let behavior = self.behavior.lock().unwrap().clone();
        match behavior {
            Behavior::Succeed(result) => Ok(result),
            Behavior::RateLimited => Err(ExtractError::Upstream {
                status: 429,
                message: "Too Many Requests".to_string(),
            }),
            Behavior::NotARecipe => Err(ExtractError::NotARecipe("holiday vlog".to_string())),
            Behavior::Empty => Ok(ExtractionResult {
                title: "Untitled".to_string(),
                ..Default::default()
            }),
            Behavior::Panic => panic!("extractor exploded"),
        }
    }
}

#[async_trait]
impl RecipeExtractor for FakeExtractor {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn extract_from_url(
        &self,
        _url: &str,
        _options: &ExtractOptions,
        progress: &ProgressFn,
    ) -> Result<ExtractionResult, ExtractError> {
        self.respond(progress).await
    }

    async fn extract_from_images(
        &self,
        images: &[ImageInput],
        _options: &ExtractOptions,
        progress: &ProgressFn,
    ) -> Result<ExtractionResult, ExtractError> {
        assert!(!images.is_empty());
        self.respond(progress).await
    }

    async fn extract_from_video(
        &self,
        media: &MediaRef,
        _metadata: &VideoMetadata,
        _options: &ExtractOptions,
        progress: &ProgressFn,
    ) -> Result<ExtractionResult, ExtractError> {
        *self.last_media.lock().unwrap() = Some(media.clone());
        self.respond(progress).await
    }
}

/// Enricher returning fixed nutrition and dietary guesses at the given confidences.
pub struct FakeEnricher {
    pub nutrition_confidence: f64,
    pub dietary_confidence: f64,
    pub calls: AtomicUsize,
}

#[async_trait]
impl RecipeEnricher for FakeEnricher {
    fn is_available(&self) -> bool {
        true
    }

    async fn enrich(
        &self,
        _recipe: &ExtractionResult,
        _language: Option<&str>,
    ) -> Result<Enrichment, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Enrichment {
            nutrition: Some(Scored {
                value: Nutrition {
                    calories: Some(520.0),
                    ..Default::default()
                },
                confidence: self.nutrition_confidence,
            }),
            dietary: Some(Scored {
                value: Default::default(),
                confidence: self.dietary_confidence,
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Downloader / exporter
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeDownloader {
    pub downloads: AtomicUsize,
    pub unavailable: AtomicBool,
}

#[async_trait]
impl VideoDownloader for FakeDownloader {
    fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    async fn fetch_metadata(&self, _url: &str) -> Result<VideoMetadata, DownloadError> {
        Ok(VideoMetadata {
            title: Some("Weeknight ramen".to_string()),
            ..Default::default()
        })
    }

    async fn download(
        &self,
        _url: &str,
        dest_dir: &Path,
        progress: &ProgressFn,
    ) -> Result<DownloadedMedia, DownloadError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        tokio::fs::create_dir_all(dest_dir).await?;
        let path = dest_dir.join("audio.mp3");
        tokio::fs::write(&path, b"ID3 fake audio").await?;
        progress(50, "Downloading video");
        progress(100, "Downloading video");
        Ok(DownloadedMedia {
            path,
            mime_type: "audio/mpeg".to_string(),
        })
    }
}

#[derive(Default)]
pub struct FakeExporter;

#[async_trait]
impl RecipeExporter for FakeExporter {
    async fn export(
        &self,
        job_id: Uuid,
        _recipe: &StoredRecipe,
        format: ExportFormat,
    ) -> Result<String, ExportError> {
        Ok(format!("https://recipes.test/exports/{job_id}.{format}"))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub fn sample_recipe() -> ExtractionResult {
    ExtractionResult {
        title: "Tomato Soup".to_string(),
        language: Some("en".to_string()),
        servings: Some(4),
        ingredients: vec![
            Ingredient {
                name: "tomatoes".to_string(),
                quantity: Some("800".to_string()),
                unit: Some("g".to_string()),
                note: None,
            },
            Ingredient {
                name: "onion".to_string(),
                quantity: Some("1".to_string()),
                ..Default::default()
            },
        ],
        steps: vec!["1. Sweat the onion".to_string(), "2. Simmer".to_string()],
        ..Default::default()
    }
}

pub struct HarnessConfig {
    pub heavy_concurrency: usize,
    pub light_concurrency: usize,
    pub heavy_timeout: Duration,
    pub light_timeout: Duration,
    pub free_limit: i64,
    pub native_video_platforms: Vec<String>,
    pub enricher: Option<Arc<FakeEnricher>>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            heavy_concurrency: 2,
            light_concurrency: 4,
            heavy_timeout: Duration::from_secs(10),
            light_timeout: Duration::from_secs(10),
            free_limit: 10,
            native_video_platforms: Vec::new(),
            enricher: None,
        }
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub store: Arc<FakeJobStore>,
    pub cache: Arc<FakeCache>,
    pub recipes: Arc<FakeRecipes>,
    pub extractor: Arc<FakeExtractor>,
    pub downloader: Arc<FakeDownloader>,
    pub bus: Arc<LocalCancelChannel>,
    pub shutdown: CancellationToken,
    pub staging: tempfile::TempDir,
    config: HarnessConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(HarnessConfig::default())
    }

    pub fn with_config(config: HarnessConfig) -> Self {
        let store = Arc::new(FakeJobStore::default());
        let cache = Arc::new(FakeCache::default());
        let recipes = Arc::new(FakeRecipes::default());
        let extractor = Arc::new(FakeExtractor::default());
        let downloader = Arc::new(FakeDownloader::default());
        let bus = Arc::new(LocalCancelChannel::new());
        let shutdown = CancellationToken::new();
        let staging = tempfile::tempdir().unwrap();

        let deps = Collaborators {
            store: store.clone(),
            cache: cache.clone(),
            recipes: recipes.clone(),
            extractor: extractor.clone(),
            enricher: config
                .enricher
                .clone()
                .map(|e| e as Arc<dyn RecipeEnricher>),
            downloader: downloader.clone(),
            exporter: Arc::new(FakeExporter),
            staging: StagingArea::new(staging.path()),
        };
        let orchestrator = start_instance(deps, &config, bus.clone(), shutdown.clone());

        Self {
            orchestrator,
            store,
            cache,
            recipes,
            extractor,
            downloader,
            bus,
            shutdown,
            staging,
            config,
        }
    }

    /// Another orchestrator over the same store, cache and cancellation channel, as if
    /// it were a second service instance.
    pub fn second_instance(&self, shutdown: CancellationToken) -> Orchestrator {
        let deps = Collaborators {
            store: self.store.clone(),
            cache: self.cache.clone(),
            recipes: self.recipes.clone(),
            extractor: self.extractor.clone(),
            enricher: self
                .config
                .enricher
                .clone()
                .map(|e| e as Arc<dyn RecipeEnricher>),
            downloader: self.downloader.clone(),
            exporter: Arc::new(FakeExporter),
            staging: StagingArea::new(self.staging.path()),
        };
        start_instance(deps, &self.config, self.bus.clone(), shutdown)
    }

    /// Write a file into the harness staging directory.
    pub fn stage_file(&self, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = self.staging.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }
}

/// Build an orchestrator and start its cancellation listener.
fn start_instance(
    deps: Collaborators,
    config: &HarnessConfig,
    bus: Arc<LocalCancelChannel>,
    shutdown: CancellationToken,
) -> Orchestrator {
    let settings = OrchestratorSettings {
        heavy_concurrency: config.heavy_concurrency,
        light_concurrency: config.light_concurrency,
        heavy_timeout: config.heavy_timeout,
        light_timeout: config.light_timeout,
        quota: QuotaPolicy {
            free_limit: config.free_limit,
            premium_limit: 100,
        },
        pipeline: PipelineSettings {
            enrichment_min_confidence: 0.6,
            native_video_platforms: config.native_video_platforms.clone(),
        },
    };
    let orchestrator = Orchestrator::new(deps, bus.clone(), settings, shutdown.clone());

    tokio::spawn(run_listener(
        bus as Arc<dyn CancelChannel>,
        orchestrator.registry().clone(),
        shutdown,
        Backoff::new(Duration::from_millis(10), Duration::from_millis(100)),
    ));
    orchestrator
}

/// The record a url or video admission of `url` without options would create.
pub fn source_job(owner_id: Uuid, job_type: JobType, url: &str) -> NewJob {
    let url = normalize_url(url).unwrap();
    NewJob {
        owner_id,
        job_type,
        idempotency_key: Some(source_key(owner_id, &url, None)),
        source_url: Some(url),
        staged_files: Vec::new(),
        export_recipe_id: None,
        export_format: None,
        options: JobOptions::default(),
        metered: true,
    }
}

pub fn free_caller() -> Caller {
    Caller {
        owner_id: Uuid::new_v4(),
        tier: Tier::Free,
    }
}

pub fn caller_with(tier: Tier) -> Caller {
    Caller {
        owner_id: Uuid::new_v4(),
        tier,
    }
}

pub fn url_request(url: &str) -> AdmitRequest {
    AdmitRequest {
        source: RequestSource::Url {
            url: url.to_string(),
        },
        options: JobOptions::default(),
    }
}

pub fn video_request(url: &str) -> AdmitRequest {
    AdmitRequest {
        source: RequestSource::Video {
            url: url.to_string(),
        },
        options: JobOptions::default(),
    }
}

/// Poll the store until the job reaches a terminal status.
pub async fn wait_for_terminal(store: &FakeJobStore, job_id: Uuid) -> ExtractionJob {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(job) = store.job(job_id) {
            if job.status.is_terminal() {
                return job;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("job {job_id} did not finish: {:?}", store.job(job_id).map(|j| j.status));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll `cond` until it holds or two seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
