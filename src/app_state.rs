use sqlx::PgPool;
use std::sync::Arc;

use crate::services::{
    cache::RedisResultCache, extractor::RecipeExtractor, orchestrator::Orchestrator,
    staging::StagingArea,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub orchestrator: Orchestrator,
    pub cache: Arc<RedisResultCache>,
    pub extractor: Arc<dyn RecipeExtractor>,
    pub staging: StagingArea,
}

impl AppState {
    pub fn new(
        db: PgPool,
        orchestrator: Orchestrator,
        cache: Arc<RedisResultCache>,
        extractor: Arc<dyn RecipeExtractor>,
        staging: StagingArea,
    ) -> Self {
        Self {
            db,
            orchestrator,
            cache,
            extractor,
            staging,
        }
    }
}
