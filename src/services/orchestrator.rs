//! Job admission and the background run of every admitted job.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::{JobStore, RecipeRepository, StoreError};
use crate::models::job::{
    ErrorCode, ExportFormat, ExtractionJob, JobOptions, JobStatus, JobType, JobWeight, NewJob,
};
use crate::services::cancellation::{CancelChannel, CancellationRegistry, Registration};
use crate::services::idempotency::{content_language, image_key, normalize_url, source_key};
use crate::services::limiter::ConcurrencyLimiter;
use crate::services::pipeline::{
    Collaborators, JobContext, JobSource, JobSpec, Outcome, PipelineError, PipelineExecutor,
    PipelineSettings, ProgressReporter,
};
use crate::services::quota::{Caller, QuotaPolicy, Tier};
use crate::services::staging::StagedFiles;

/// Past its deadline by this much, a non-terminal job has no task left to finish it.
const ORPHAN_GRACE: Duration = Duration::from_secs(60);

const ORPHANED_MESSAGE: &str = "Orphaned: the instance running this job stopped before it finished";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub heavy_concurrency: usize,
    pub light_concurrency: usize,
    pub heavy_timeout: Duration,
    pub light_timeout: Duration,
    pub quota: QuotaPolicy,
    pub pipeline: PipelineSettings,
}

impl OrchestratorSettings {
    fn timeout_for(&self, weight: JobWeight) -> Duration {
        match weight {
            JobWeight::Heavy => self.heavy_timeout,
            JobWeight::Light => self.light_timeout,
        }
    }
}

/// What the caller wants extracted.
#[derive(Debug)]
pub enum RequestSource {
    Url { url: String },
    Video { url: String },
    /// Uploads already written to the staging area, with the hash of their bytes.
    Images { files: StagedFiles, content_hash: String },
    Conversion { recipe_id: Uuid, format: ExportFormat },
}

#[derive(Debug)]
pub struct AdmitRequest {
    pub source: RequestSource,
    pub options: JobOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub job_id: Uuid,
    pub status: JobStatus,
    /// The request resolved to an existing job; no new work was started.
    pub deduplicated: bool,
}

/// Synchronous rejections; nothing is created or started.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Monthly extraction quota exceeded ({used}/{limit})")]
    QuotaExceeded { used: i64, limit: i64 },

    #[error("Not found")]
    NotFound,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Admits extraction requests and drives each admitted job to a terminal state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn JobStore>,
    recipes: Arc<dyn RecipeRepository>,
    bus: Arc<dyn CancelChannel>,
    registry: CancellationRegistry,
    limiter: ConcurrencyLimiter,
    executor: PipelineExecutor,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    /// Job lifetimes are children of `shutdown`.
    pub fn new(
        deps: Collaborators,
        bus: Arc<dyn CancelChannel>,
        settings: OrchestratorSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let inner = Inner {
            store: Arc::clone(&deps.store),
            recipes: Arc::clone(&deps.recipes),
            bus,
            registry: CancellationRegistry::new(shutdown),
            limiter: ConcurrencyLimiter::new(settings.heavy_concurrency, settings.light_concurrency),
            executor: PipelineExecutor::new(deps, settings.pipeline.clone()),
            settings,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn registry(&self) -> &CancellationRegistry {
        &self.inner.registry
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.inner.limiter
    }

    /// Admit a request: resolve it to an existing job, or create one and start it
    /// in the background. Returns before any pipeline work begins.
    pub async fn admit(
        &self,
        caller: Caller,
        request: AdmitRequest,
    ) -> Result<Admission, AdmissionError> {
        let AdmitRequest { source, options } = request;
        let owner_id = caller.owner_id;

        let (source, idempotency_key) = match source {
            RequestSource::Url { url } => {
                let url = normalize_url(&url).map_err(|e| AdmissionError::Validation(e.to_string()))?;
                let key = source_key(owner_id, &url, options.language.as_deref());
                (JobSource::Url { url }, Some(key))
            }
            RequestSource::Video { url } => {
                let url = normalize_url(&url).map_err(|e| AdmissionError::Validation(e.to_string()))?;
                let key = source_key(owner_id, &url, options.language.as_deref());
                (JobSource::Video { url }, Some(key))
            }
            RequestSource::Images {
                files,
                content_hash,
            } => {
                if files.images().is_empty() {
                    return Err(AdmissionError::Validation("at least one image is required".into()));
                }
                (JobSource::Images { files }, Some(image_key(owner_id, &content_hash)))
            }
            RequestSource::Conversion { recipe_id, format } => {
                let recipe = self
                    .inner
                    .recipes
                    .get(recipe_id)
                    .await?
                    .filter(|r| r.owner_id == owner_id || r.is_public || caller.tier == Tier::Admin)
                    .ok_or(AdmissionError::NotFound)?;
                (
                    JobSource::Conversion {
                        recipe_id: recipe.id,
                        format,
                    },
                    None,
                )
            }
        };

        if let Some(key) = &idempotency_key {
            if let Some(existing) = self.inner.store.get_by_idempotency_key(owner_id, key).await? {
                let existing = self.settle_orphan(existing).await?;
                if let Some(admission) = reuse(&existing, options.force_refresh) {
                    return Ok(admission);
                }
            }
        }

        let mut new_job = NewJob {
            owner_id,
            job_type: source.job_type(),
            source_url: source.source_url().map(str::to_string),
            staged_files: match &source {
                JobSource::Images { files } => files.images().to_vec(),
                _ => Vec::new(),
            },
            export_recipe_id: None,
            export_format: None,
            options,
            idempotency_key,
            metered: false,
        };
        if let JobSource::Conversion { recipe_id, format } = &source {
            new_job.export_recipe_id = Some(*recipe_id);
            new_job.export_format = Some(*format);
        }

        if let Some(admission) = self.try_clone_shared(caller, &new_job).await? {
            return Ok(admission);
        }

        new_job.metered = new_job.job_type.is_metered();
        if new_job.metered {
            self.check_quota(caller).await?;
        }

        let job = match self.create(new_job).await? {
            Created::New(job) => job,
            Created::Existing(admission) => return Ok(admission),
        };

        let spec = JobSpec {
            job_id: job.id,
            owner_id,
            source,
            options: job.options.clone(),
        };
        metrics::counter!("extraction_jobs_admitted_total", "type" => job.job_type.to_string())
            .increment(1);
        tracing::info!(job_id = %job.id, owner_id = %owner_id, job_type = %job.job_type, "Job admitted");

        // Registered before the task starts so an immediate cancel is not lost.
        let registration = self.inner.registry.register(job.id);
        let this = self.clone();
        tokio::spawn(async move { this.run(spec, registration).await });

        Ok(Admission {
            job_id: job.id,
            status: JobStatus::Pending,
            deduplicated: false,
        })
    }

    async fn check_quota(&self, caller: Caller) -> Result<(), AdmissionError> {
        let Some(limit) = self.inner.settings.quota.limit_for(caller.tier) else {
            return Ok(());
        };
        let used = self
            .inner
            .store
            .count_used_this_month(caller.owner_id)
            .await?;
        if used >= limit {
            tracing::info!(owner_id = %caller.owner_id, used, limit, "Quota exceeded");
            return Err(AdmissionError::QuotaExceeded { used, limit });
        }
        Ok(())
    }

    async fn create(&self, new_job: NewJob) -> Result<Created, AdmissionError> {
        let owner_id = new_job.owner_id;
        let key = new_job.idempotency_key.clone();
        match self.inner.store.create(new_job).await {
            Ok(job) => Ok(Created::New(job)),
            // Lost a race with a concurrent admission of the same request.
            Err(StoreError::DuplicateKey) => {
                let existing = match key {
                    Some(key) => self.inner.store.get_by_idempotency_key(owner_id, &key).await?,
                    None => None,
                };
                existing
                    .map(|job| Created::Existing(deduplicated(&job)))
                    .ok_or(AdmissionError::Store(StoreError::DuplicateKey))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Complete the job immediately from a public recipe for the same source, if
    /// the caller's tier allows it.
    async fn try_clone_shared(
        &self,
        caller: Caller,
        new_job: &NewJob,
    ) -> Result<Option<Admission>, AdmissionError> {
        let options = &new_job.options;
        if !self.inner.settings.quota.can_clone_shared(caller.tier)
            || !options.save_auto
            || options.force_refresh
        {
            return Ok(None);
        }
        let (Some(url), Some(language)) = (&new_job.source_url, &options.language) else {
            return Ok(None);
        };
        let language = content_language(None, Some(language));

        let recipes = &self.inner.recipes;
        let Some(shared) = recipes.find_shared_by_source(url, &language).await? else {
            return Ok(None);
        };
        let recipe_id = match recipes.find_by_source(caller.owner_id, url, &language).await? {
            Some(own) => own,
            None => recipes.clone_for_owner(shared, caller.owner_id).await?,
        };

        let job = match self.create(new_job.clone()).await? {
            Created::New(job) => job,
            Created::Existing(admission) => return Ok(Some(admission)),
        };
        self.inner
            .store
            .mark_completed(job.id, Some(recipe_id), None)
            .await?;

        tracing::info!(job_id = %job.id, recipe_id = %recipe_id, source = %shared, "Completed from shared recipe");
        metrics::counter!("extraction_jobs_completed_total", "type" => job.job_type.to_string())
            .increment(1);
        Ok(Some(Admission {
            job_id: job.id,
            status: JobStatus::Completed,
            deduplicated: false,
        }))
    }

    /// Request cancellation: signal locally and broadcast to every instance.
    pub async fn cancel(&self, caller: Caller, job_id: Uuid) -> Result<JobStatus, AdmissionError> {
        let job = self.get_status(caller, job_id).await?;
        if job.status.is_terminal() {
            return Ok(job.status);
        }

        let local = self.inner.registry.cancel_local(job_id);
        if let Err(e) = self.inner.bus.publish(job_id).await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to broadcast cancellation");
        }
        tracing::info!(job_id = %job_id, local, "Cancellation requested");
        Ok(job.status)
    }

    /// Current state of a job visible to `caller`.
    pub async fn get_status(
        &self,
        caller: Caller,
        job_id: Uuid,
    ) -> Result<ExtractionJob, AdmissionError> {
        let job = self
            .inner
            .store
            .get(job_id)
            .await?
            .filter(|job| job.owner_id == caller.owner_id || caller.tier == Tier::Admin)
            .ok_or(AdmissionError::NotFound)?;
        Ok(self.settle_orphan(job).await?)
    }

    /// Fail jobs left non-terminal by an instance that stopped mid-run.
    pub async fn sweep_orphaned(&self) -> Result<u64, StoreError> {
        let mut failed = 0;
        for weight in [JobWeight::Light, JobWeight::Heavy] {
            let Some(cutoff) = self.orphan_cutoff(weight) else {
                continue;
            };
            let types: Vec<JobType> = JobType::ALL
                .into_iter()
                .filter(|t| t.weight() == weight)
                .collect();
            failed += self
                .inner
                .store
                .fail_orphaned_before(&types, cutoff, ORPHANED_MESSAGE)
                .await?;
        }
        if failed > 0 {
            tracing::warn!(failed, "Failed orphaned jobs");
        }
        Ok(failed)
    }

    /// Jobs of `weight` created before this can no longer be running anywhere.
    fn orphan_cutoff(&self, weight: JobWeight) -> Option<DateTime<Utc>> {
        let age = self.inner.settings.timeout_for(weight) + ORPHAN_GRACE;
        Utc::now().checked_sub_signed(chrono::Duration::from_std(age).ok()?)
    }

    /// Fail `job` if no task can still finish it, and return its current record.
    async fn settle_orphan(&self, job: ExtractionJob) -> Result<ExtractionJob, StoreError> {
        if job.status.is_terminal() || self.inner.registry.contains(job.id) {
            return Ok(job);
        }
        let weight = job.job_type.weight();
        let Some(cutoff) = self.orphan_cutoff(weight).filter(|c| job.created_at < *c) else {
            return Ok(job);
        };

        if self
            .inner
            .store
            .fail_orphaned(job.id, cutoff, ORPHANED_MESSAGE)
            .await?
        {
            metrics::counter!(
                "extraction_jobs_failed_total",
                "type" => job.job_type.to_string(),
                "code" => ErrorCode::TransientFailure.to_string()
            )
            .increment(1);
            tracing::warn!(job_id = %job.id, created_at = %job.created_at, "Orphaned job failed");
        }
        Ok(self.inner.store.get(job.id).await?.unwrap_or(job))
    }

    async fn run(self, spec: JobSpec, registration: Registration) {
        let job_id = spec.job_id;
        let job_type = spec.job_type();
        let started = Instant::now();
        let deadline = started + self.inner.settings.timeout_for(job_type.weight());

        let (progress, forwarder) = ProgressReporter::spawn(Arc::clone(&self.inner.store), job_id);
        let ctx = JobContext::new(
            job_id,
            spec.owner_id,
            registration.token().clone(),
            self.inner.registry.shutdown_token().clone(),
            deadline,
            progress,
        );

        let result = AssertUnwindSafe(self.drive(spec, &ctx)).catch_unwind().await;
        drop(ctx);
        forwarder.drain().await;

        let result = result.unwrap_or_else(|panic| {
            let message = panic_message(panic.as_ref());
            tracing::error!(job_id = %job_id, panic = %message, "Job panicked");
            Err(PipelineError::Internal(message))
        });

        self.finalize(job_id, job_type, result).await;
        metrics::histogram!("extraction_job_seconds", "type" => job_type.to_string())
            .record(started.elapsed().as_secs_f64());
        drop(registration);
    }

    /// Wait for a slot, then run the pipeline under the job deadline.
    async fn drive(&self, spec: JobSpec, ctx: &JobContext) -> Result<Outcome, PipelineError> {
        let weight = spec.job_type().weight();
        let _permit = tokio::select! {
            biased;
            _ = ctx.token().cancelled() => return Err(ctx.interruption()),
            _ = tokio::time::sleep_until(ctx.deadline) => {
                return Err(PipelineError::Timeout("waiting for a free slot"));
            }
            permit = self.inner.limiter.acquire(weight) => {
                permit.map_err(|_| PipelineError::ShuttingDown)?
            }
        };
        let _running = RunningGauge::enter(weight);

        match tokio::time::timeout_at(ctx.deadline, self.inner.executor.run(spec, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout("before the job finished")),
        }
    }

    /// Single terminal write for the job.
    async fn finalize(&self, job_id: Uuid, job_type: JobType, result: Result<Outcome, PipelineError>) {
        let store = &self.inner.store;
        let job_type_label = job_type.to_string();

        let error = match result {
            Ok(Outcome::Recipe { recipe_id, result }) => {
                match store.mark_completed(job_id, recipe_id, Some(&result)).await {
                    Ok(()) => None,
                    Err(e) => Some(PipelineError::Save(e.to_string())),
                }
            }
            Ok(Outcome::Export { url }) => match store.mark_completed_with_url(job_id, &url).await {
                Ok(()) => None,
                Err(e) => Some(PipelineError::Save(e.to_string())),
            },
            Err(e) => Some(e),
        };

        let Some(error) = error else {
            metrics::counter!("extraction_jobs_completed_total", "type" => job_type_label).increment(1);
            tracing::info!(job_id = %job_id, "Job completed");
            return;
        };

        if matches!(error, PipelineError::Cancelled) {
            metrics::counter!("extraction_jobs_cancelled_total", "type" => job_type_label).increment(1);
            tracing::info!(job_id = %job_id, "Job cancelled");
            if let Err(e) = store.mark_cancelled(job_id).await {
                tracing::error!(job_id = %job_id, error = %e, "Failed to record cancellation");
            }
            return;
        }

        let code = error.code();
        metrics::counter!(
            "extraction_jobs_failed_total",
            "type" => job_type_label,
            "code" => code.to_string()
        )
        .increment(1);
        tracing::warn!(job_id = %job_id, code = %code, error = %error, "Job failed");
        if let Err(e) = store.mark_failed(job_id, code, &error.to_string()).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to record job failure");
        }
    }
}

enum Created {
    New(ExtractionJob),
    Existing(Admission),
}

fn deduplicated(job: &ExtractionJob) -> Admission {
    metrics::counter!("extraction_jobs_deduplicated_total").increment(1);
    tracing::info!(job_id = %job.id, status = %job.status, "Request resolved to existing job");
    Admission {
        job_id: job.id,
        status: job.status,
        deduplicated: true,
    }
}

/// An existing job answers the request while it is running, or once it has a
/// result and the caller did not force a refresh.
fn reuse(existing: &ExtractionJob, force_refresh: bool) -> Option<Admission> {
    if !existing.status.is_terminal() || (existing.has_result() && !force_refresh) {
        Some(deduplicated(existing))
    } else {
        None
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Tracks `extraction_jobs_running` for the lifetime of a pipeline run.
struct RunningGauge(JobWeight);

impl RunningGauge {
    fn enter(weight: JobWeight) -> Self {
        metrics::gauge!("extraction_jobs_running", "weight" => weight.to_string()).increment(1.0);
        Self(weight)
    }
}

impl Drop for RunningGauge {
    fn drop(&mut self) {
        metrics::gauge!("extraction_jobs_running", "weight" => self.0.to_string()).decrement(1.0);
    }
}
