//! Clean-up pass over raw AI output before it is enriched and saved.

use std::collections::HashSet;

use crate::models::recipe::ExtractionResult;

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("No usable recipe: {0}")]
pub struct NoRecipe(pub &'static str);

/// Normalize whitespace, drop empty and duplicate entries, and reject results
/// with no title or no ingredients.
pub fn refine(mut result: ExtractionResult) -> Result<ExtractionResult, NoRecipe> {
    result.title = collapse_whitespace(&result.title);
    result.description = result
        .description
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty());

    let mut seen = HashSet::new();
    result.ingredients = result
        .ingredients
        .into_iter()
        .filter_map(|mut ing| {
            ing.name = collapse_whitespace(&ing.name);
            ing.quantity = non_blank(ing.quantity);
            ing.unit = non_blank(ing.unit);
            ing.note = non_blank(ing.note);
            if ing.name.is_empty() {
                return None;
            }
            seen.insert(ing.line().to_lowercase()).then_some(ing)
        })
        .collect();

    result.steps = result
        .steps
        .iter()
        .map(|s| strip_step_number(s.trim()).to_string())
        .filter(|s| !s.is_empty())
        .collect();

    result.servings = result.servings.filter(|&s| s > 0);
    result.prep_time_minutes = result.prep_time_minutes.filter(|&m| m > 0);
    result.cook_time_minutes = result.cook_time_minutes.filter(|&m| m > 0);
    result.language = non_blank(result.language).map(|l| l.to_lowercase());

    if result.title.is_empty() {
        return Err(NoRecipe("missing title"));
    }
    if result.ingredients.is_empty() {
        return Err(NoRecipe("no ingredients"));
    }
    Ok(result)
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| collapse_whitespace(&v))
        .filter(|v| !v.is_empty())
}

/// "1. Mix", "2) Mix", "Step 3: Mix" -> "Mix".
fn strip_step_number(step: &str) -> &str {
    let mut rest = step;
    if rest.get(..4).is_some_and(|p| p.eq_ignore_ascii_case("step")) {
        rest = rest[4..].trim_start();
    }
    let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return step;
    }
    let after = &rest[digits..];
    match after.strip_prefix(['.', ')', ':']) {
        Some(text) => text.trim_start(),
        None if rest.len() != step.len() => after.trim_start(),
        None => step,
    }
}
