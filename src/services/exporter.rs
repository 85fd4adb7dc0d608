use async_trait::async_trait;
use serde_json::json;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::models::job::ExportFormat;
use crate::models::recipe::StoredRecipe;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("Failed to write export: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to render export: {0}")]
    Render(#[from] serde_json::Error),
}

/// Renders a saved recipe into a downloadable document and returns its URL.
#[async_trait]
pub trait RecipeExporter: Send + Sync {
    async fn export(
        &self,
        job_id: Uuid,
        recipe: &StoredRecipe,
        format: ExportFormat,
    ) -> Result<String, ExportError>;
}

/// Writes exports into a directory served as static files.
pub struct FileExporter {
    dir: PathBuf,
    public_base_url: String,
}

impl FileExporter {
    pub fn new(dir: impl Into<PathBuf>, public_base_url: &str) -> Self {
        Self {
            dir: dir.into(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Delete exported files last modified at least `max_age` ago. Returns how many
    /// were removed.
    pub async fn remove_expired(&self, max_age: Duration) -> Result<usize, ExportError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let age = metadata.modified()?.elapsed().unwrap_or_default();
            if age < max_age {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl RecipeExporter for FileExporter {
    async fn export(
        &self,
        job_id: Uuid,
        recipe: &StoredRecipe,
        format: ExportFormat,
    ) -> Result<String, ExportError> {
        let (body, extension) = match format {
            ExportFormat::JsonLd => (serde_json::to_string_pretty(&json_ld(recipe))?, "jsonld"),
            ExportFormat::Text => (plain_text(recipe), "txt"),
        };

        tokio::fs::create_dir_all(&self.dir).await?;
        let file_name = format!("{job_id}.{extension}");
        tokio::fs::write(self.dir.join(&file_name), body).await?;

        Ok(format!("{}/exports/{file_name}", self.public_base_url))
    }
}

fn iso_minutes(minutes: Option<u32>) -> Option<String> {
    minutes.map(|m| format!("PT{m}M"))
}

/// schema.org `Recipe` document.
pub fn json_ld(stored: &StoredRecipe) -> serde_json::Value {
    let recipe = &stored.recipe;
    let mut doc = json!({
        "@context": "https://schema.org",
        "@type": "Recipe",
        "name": recipe.title,
        "recipeIngredient": recipe.ingredients.iter().map(|i| i.line()).collect::<Vec<_>>(),
        "recipeInstructions": recipe
            .steps
            .iter()
            .map(|s| json!({"@type": "HowToStep", "text": s}))
            .collect::<Vec<_>>(),
    });

    let optional = [
        ("description", recipe.description.clone().map(Into::into)),
        ("inLanguage", Some(stored.language.clone()).filter(|l| !l.is_empty()).map(Into::into)),
        ("recipeYield", recipe.servings.map(|s| format!("{s} servings").into())),
        ("prepTime", iso_minutes(recipe.prep_time_minutes).map(Into::into)),
        ("cookTime", iso_minutes(recipe.cook_time_minutes).map(Into::into)),
        ("image", recipe.thumbnail_url.clone().map(Into::into)),
        ("url", stored.source_url.clone().map(Into::into)),
        (
            "nutrition",
            recipe.nutrition.as_ref().and_then(|n| {
                n.calories.map(|kcal| {
                    json!({"@type": "NutritionInformation", "calories": format!("{kcal:.0} kcal")})
                })
            }),
        ),
    ];
    if let Some(obj) = doc.as_object_mut() {
        for (key, value) in optional {
            if let Some(value) = value {
                obj.insert(key.to_string(), value);
            }
        }
    }
    doc
}

pub fn plain_text(stored: &StoredRecipe) -> String {
    let recipe = &stored.recipe;
    let mut out = String::new();
    let _ = writeln!(out, "{}", recipe.title);
    if let Some(description) = &recipe.description {
        let _ = writeln!(out, "\n{description}");
    }
    if let Some(servings) = recipe.servings {
        let _ = writeln!(out, "\nServings: {servings}");
    }

    let _ = writeln!(out, "\nIngredients");
    for ingredient in &recipe.ingredients {
        let _ = writeln!(out, "- {}", ingredient.line());
    }

    let _ = writeln!(out, "\nSteps");
    for (idx, step) in recipe.steps.iter().enumerate() {
        let _ = writeln!(out, "{}. {step}", idx + 1);
    }

    if let Some(url) = &stored.source_url {
        let _ = writeln!(out, "\nSource: {url}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::recipe::{ExtractionResult, Ingredient};
    use chrono::Utc;

    fn stored() -> StoredRecipe {
        StoredRecipe {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            source_url: Some("https://example.com/r".into()),
            language: "en".into(),
            is_public: false,
            recipe: ExtractionResult {
                title: "Flatbread".into(),
                servings: Some(4),
                prep_time_minutes: Some(15),
                ingredients: vec![Ingredient {
                    name: "flour".into(),
                    quantity: Some("300".into()),
                    unit: Some("g".into()),
                    note: None,
                }],
                steps: vec!["Mix".into(), "Bake".into()],
                ..Default::default()
            },
            created_at: Utc::now(),
        }
    }

    #[test]
    fn json_ld_is_schema_org_recipe() {
        let doc = json_ld(&stored());
        assert_eq!(doc["@type"], "Recipe");
        assert_eq!(doc["recipeIngredient"][0], "300 g flour");
        assert_eq!(doc["recipeInstructions"][1]["text"], "Bake");
        assert_eq!(doc["prepTime"], "PT15M");
        assert_eq!(doc["inLanguage"], "en");
        assert!(doc.get("cookTime").is_none());
    }

    #[test]
    fn text_numbers_steps() {
        let text = plain_text(&stored());
        assert!(text.starts_with("Flatbread\n"));
        assert!(text.contains("- 300 g flour"));
        assert!(text.contains("2. Bake"));
        assert!(text.contains("Source: https://example.com/r"));
    }

    #[tokio::test]
    async fn writes_file_and_returns_public_url() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = FileExporter::new(dir.path(), "https://api.example.com/");
        let job_id = Uuid::new_v4();

        let url = exporter
            .export(job_id, &stored(), ExportFormat::Text)
            .await
            .unwrap();

        assert_eq!(url, format!("https://api.example.com/exports/{job_id}.txt"));
        assert!(dir.path().join(format!("{job_id}.txt")).exists());
    }

    #[tokio::test]
    async fn expired_exports_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = FileExporter::new(dir.path(), "https://api.example.com");
        let job_id = Uuid::new_v4();
        exporter
            .export(job_id, &stored(), ExportFormat::JsonLd)
            .await
            .unwrap();
        let path = dir.path().join(format!("{job_id}.jsonld"));

        let kept = exporter.remove_expired(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(kept, 0);
        assert!(path.exists());

        let removed = exporter.remove_expired(Duration::ZERO).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn missing_export_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = FileExporter::new(dir.path().join("never-created"), "https://api.example.com");
        assert_eq!(exporter.remove_expired(Duration::ZERO).await.unwrap(), 0);
    }
}
