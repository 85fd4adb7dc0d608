use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Structured recipe produced by the AI extractor.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExtractionResult {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Content language as detected by the extractor (ISO 639-1).
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub servings: Option<u32>,
    #[serde(default)]
    pub prep_time_minutes: Option<u32>,
    #[serde(default)]
    pub cook_time_minutes: Option<u32>,
    #[serde(default)]
    pub ingredients: Vec<Ingredient>,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nutrition: Option<Nutrition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dietary: Option<DietaryInfo>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Ingredient {
    pub name: String,
    #[serde(default)]
    pub quantity: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

impl Ingredient {
    /// Single display line, used for duplicate detection.
    pub fn line(&self) -> String {
        [self.quantity.as_deref(), self.unit.as_deref(), Some(self.name.as_str())]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Per-serving nutrition estimate.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Nutrition {
    pub calories: Option<f64>,
    pub protein_g: Option<f64>,
    pub carbs_g: Option<f64>,
    pub fat_g: Option<f64>,
    pub fiber_g: Option<f64>,
    pub sugar_g: Option<f64>,
    pub sodium_mg: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DietaryInfo {
    pub vegetarian: Option<bool>,
    pub vegan: Option<bool>,
    pub gluten_free: Option<bool>,
    pub dairy_free: Option<bool>,
    #[serde(default)]
    pub allergens: Vec<String>,
}

/// Memoized extraction keyed by the hash of a normalized source URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedExtraction {
    pub source_hash: String,
    pub payload: ExtractionResult,
    pub hit_count: i64,
    pub cached_at: DateTime<Utc>,
}

impl CachedExtraction {
    pub fn into_result(self) -> ExtractionResult {
        self.payload
    }
}

/// A recipe saved in an owner's collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecipe {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub source_url: Option<String>,
    pub language: String,
    pub is_public: bool,
    pub recipe: ExtractionResult,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingredient_line_skips_missing_parts() {
        let ing = Ingredient {
            name: "flour".into(),
            quantity: Some("200".into()),
            unit: Some("g".into()),
            note: None,
        };
        assert_eq!(ing.line(), "200 g flour");

        let bare = Ingredient {
            name: "salt".into(),
            ..Default::default()
        };
        assert_eq!(bare.line(), "salt");
    }

    #[test]
    fn partial_ai_payload_deserializes() {
        let json = r#"{"title": "Pancakes", "ingredients": [{"name": "egg"}]}"#;
        let result: ExtractionResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.title, "Pancakes");
        assert_eq!(result.ingredients.len(), 1);
        assert!(result.steps.is_empty());
        assert!(result.nutrition.is_none());
    }
}
