use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db::queries::StoreError;
use crate::models::recipe::{ExtractionResult, StoredRecipe};

/// The owner's saved recipes, as seen by the extraction pipeline.
///
/// Inserts are upserts keyed by (owner, source URL, language), so concurrent saves
/// of the same source converge on one recipe.
#[async_trait]
pub trait RecipeRepository: Send + Sync {
    /// Existing recipe of `owner_id` extracted from `source_url` in `language`.
    async fn find_by_source(
        &self,
        owner_id: Uuid,
        source_url: &str,
        language: &str,
    ) -> Result<Option<Uuid>, StoreError>;

    async fn insert(
        &self,
        owner_id: Uuid,
        recipe: &ExtractionResult,
        source_url: Option<&str>,
        language: &str,
    ) -> Result<Uuid, StoreError>;

    /// A public recipe from any owner for this exact source and language.
    async fn find_shared_by_source(
        &self,
        source_url: &str,
        language: &str,
    ) -> Result<Option<Uuid>, StoreError>;

    /// Copy a recipe into `owner_id`'s collection, returning the copy's id.
    async fn clone_for_owner(&self, recipe_id: Uuid, owner_id: Uuid) -> Result<Uuid, StoreError>;

    async fn get(&self, recipe_id: Uuid) -> Result<Option<StoredRecipe>, StoreError>;
}

/// PostgreSQL-backed [`RecipeRepository`].
pub struct PgRecipeRepository {
    pool: PgPool,
}

impl PgRecipeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecipeRepository for PgRecipeRepository {
    async fn find_by_source(
        &self,
        owner_id: Uuid,
        source_url: &str,
        language: &str,
    ) -> Result<Option<Uuid>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id FROM recipes
            WHERE owner_id = $1 AND source_url = $2 AND language = $3
            LIMIT 1
            "#,
        )
        .bind(owner_id)
        .bind(source_url)
        .bind(language)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.try_get::<Uuid, _>("id")).transpose()?)
    }

    async fn insert(
        &self,
        owner_id: Uuid,
        recipe: &ExtractionResult,
        source_url: Option<&str>,
        language: &str,
    ) -> Result<Uuid, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO recipes (owner_id, title, payload, source_url, language)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (owner_id, source_url, language) WHERE source_url IS NOT NULL
            DO UPDATE SET updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(owner_id)
        .bind(&recipe.title)
        .bind(Json(recipe))
        .bind(source_url)
        .bind(language)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    async fn find_shared_by_source(
        &self,
        source_url: &str,
        language: &str,
    ) -> Result<Option<Uuid>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id FROM recipes
            WHERE is_public AND source_url = $1 AND language = $2
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(source_url)
        .bind(language)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.try_get::<Uuid, _>("id")).transpose()?)
    }

    async fn clone_for_owner(&self, recipe_id: Uuid, owner_id: Uuid) -> Result<Uuid, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO recipes (owner_id, title, payload, source_url, language, is_public, cloned_from)
            SELECT $2, title, payload, source_url, language, FALSE, id
            FROM recipes
            WHERE id = $1
            ON CONFLICT (owner_id, source_url, language) WHERE source_url IS NOT NULL
            DO UPDATE SET updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(recipe_id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(r.try_get("id")?),
            None => Err(StoreError::Corrupt(format!("recipe {recipe_id} vanished during clone"))),
        }
    }

    async fn get(&self, recipe_id: Uuid) -> Result<Option<StoredRecipe>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, owner_id, source_url, language, is_public, payload, created_at
            FROM recipes
            WHERE id = $1
            "#,
        )
        .bind(recipe_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(r) = row else {
            return Ok(None);
        };
        let payload: Json<ExtractionResult> = r.try_get("payload")?;

        Ok(Some(StoredRecipe {
            id: r.try_get("id")?,
            owner_id: r.try_get("owner_id")?,
            source_url: r.try_get("source_url")?,
            language: r.try_get("language")?,
            is_public: r.try_get("is_public")?,
            recipe: payload.0,
            created_at: r.try_get("created_at")?,
        }))
    }
}
