use async_trait::async_trait;
use serde::Deserialize;

use crate::models::recipe::{DietaryInfo, ExtractionResult, Nutrition};
use crate::services::extractor::ExtractError;

/// A value inferred by the enricher together with its confidence in `[0, 1]`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Scored<T> {
    pub value: T,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enrichment {
    pub nutrition: Option<Scored<Nutrition>>,
    pub dietary: Option<Scored<DietaryInfo>>,
}

/// Which enrichment fields made it past the confidence threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedFields {
    pub nutrition: bool,
    pub dietary: bool,
}

impl Enrichment {
    /// Copy fields with `confidence >= min_confidence` into `result`; drop the rest.
    pub fn apply(self, result: &mut ExtractionResult, min_confidence: f64) -> AppliedFields {
        let mut applied = AppliedFields::default();
        if let Some(nutrition) = self.nutrition.filter(|n| n.confidence >= min_confidence) {
            result.nutrition = Some(nutrition.value);
            applied.nutrition = true;
        }
        if let Some(dietary) = self.dietary.filter(|d| d.confidence >= min_confidence) {
            result.dietary = Some(dietary.value);
            applied.dietary = true;
        }
        applied
    }
}

/// Nutrition/dietary inference over a finished extraction.
#[async_trait]
pub trait RecipeEnricher: Send + Sync {
    fn is_available(&self) -> bool;

    async fn enrich(
        &self,
        recipe: &ExtractionResult,
        language: Option<&str>,
    ) -> Result<Enrichment, ExtractError>;
}
