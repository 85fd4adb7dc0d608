use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use scraper::{Html, Selector};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

use crate::models::job::DetailLevel;
use crate::models::recipe::{DietaryInfo, ExtractionResult, Nutrition};
use crate::services::enrichment::{Enrichment, RecipeEnricher, Scored};
use crate::services::extractor::{
    ExtractError, ExtractOptions, ImageInput, MediaRef, ProgressFn, RecipeExtractor, VideoMetadata,
};

const TEXT_MODEL: &str = "@cf/meta/llama-3.1-8b-instruct";
const VISION_MODEL: &str = "@cf/llava-hf/llava-1.5-7b-hf";
const SPEECH_MODEL: &str = "@cf/openai/whisper";

/// Upper bound on page/transcript text sent to the text model.
const MAX_SOURCE_CHARS: usize = 24_000;

const RECIPE_SCHEMA: &str = concat!(
    "Return ONLY valid JSON with these exact field names: ",
    "is_recipe (boolean), title, description, language (ISO 639-1 code), servings (integer), ",
    "prep_time_minutes (integer), cook_time_minutes (integer), ",
    "ingredients (array of {name, quantity, unit, note}), steps (array of strings). ",
    "If the content does not describe a recipe, return {\"is_recipe\": false, \"reason\": \"...\"}."
);

/// Client for Cloudflare Workers AI, used both as recipe extractor and enricher.
pub struct WorkersAiClient {
    http: Client,
    account_id: String,
    api_token: String,
}

#[derive(Deserialize)]
struct AiEnvelope<T> {
    result: T,
}

#[derive(Deserialize)]
struct TextResult {
    response: String,
}

#[derive(Deserialize)]
struct VisionResult {
    description: String,
}

#[derive(Deserialize)]
struct SpeechResult {
    text: String,
}

/// Relevance flag the model sets alongside (or instead of) the recipe fields.
#[derive(Deserialize)]
struct AiVerdict {
    #[serde(default = "default_true")]
    is_recipe: bool,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct AiEnrichment {
    nutrition: Option<Nutrition>,
    #[serde(default)]
    nutrition_confidence: f64,
    dietary: Option<DietaryInfo>,
    #[serde(default)]
    dietary_confidence: f64,
}

fn default_true() -> bool {
    true
}

impl WorkersAiClient {
    pub fn new(account_id: &str, api_token: &str) -> Result<Self, ExtractError> {
        let http = Client::builder()
            .user_agent("Mozilla/5.0 (compatible; RecipeExtractBot/1.0)")
            .timeout(Duration::from_secs(180))
            .build()?;

        Ok(Self {
            http,
            account_id: account_id.to_string(),
            api_token: api_token.to_string(),
        })
    }

    fn model_url(&self, model: &str) -> String {
        format!(
            "https://api.cloudflare.com/client/v4/accounts/{}/ai/run/{}",
            self.account_id, model
        )
    }

    async fn run<T: DeserializeOwned>(
        &self,
        model: &str,
        body: serde_json::Value,
    ) -> Result<T, ExtractError> {
        let response = self
            .http
            .post(self.model_url(model))
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ExtractError::RateLimited(response.text().await.unwrap_or_default()));
        }
        if !status.is_success() {
            return Err(ExtractError::Upstream {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let envelope: AiEnvelope<T> = response.json().await?;
        Ok(envelope.result)
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String, ExtractError> {
        let body = serde_json::json!({
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "max_tokens": 2048,
        });
        let result: TextResult = self.run(TEXT_MODEL, body).await?;
        Ok(result.response)
    }

    /// Turn free text (page text, image descriptions, a transcript) into a recipe.
    async fn structure(
        &self,
        source_text: &str,
        options: &ExtractOptions,
    ) -> Result<ExtractionResult, ExtractError> {
        let system = format!(
            "You extract cooking recipes from content. {} {} {}",
            detail_instruction(options.detail_level),
            language_instruction(options.language.as_deref()),
            RECIPE_SCHEMA
        );
        let response = self.complete(&system, truncate_chars(source_text, MAX_SOURCE_CHARS)).await?;
        parse_recipe_json(&response)
    }

    async fn fetch_page(&self, url: &str) -> Result<String, ExtractError> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ExtractError::Upstream {
                status: status.as_u16(),
                message: format!("fetching {url}"),
            });
        }
        Ok(response.text().await?)
    }
}

fn detail_instruction(level: DetailLevel) -> &'static str {
    match level {
        DetailLevel::Brief => "Keep steps short and merge trivial ones.",
        DetailLevel::Standard => "Keep steps as written.",
        DetailLevel::Detailed => "Keep every step, including tips, temperatures and timings.",
    }
}

fn language_instruction(language: Option<&str>) -> String {
    match language {
        Some(lang) => format!("Write all text in language '{lang}'."),
        None => "Keep the original language of the content.".to_string(),
    }
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Pull the first JSON object out of a model response and map it to a recipe.
fn parse_recipe_json(raw: &str) -> Result<ExtractionResult, ExtractError> {
    let start = raw.find('{');
    let end = raw.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if e > s => &raw[s..=e],
        _ => return Err(ExtractError::Parse("no JSON object in response".to_string())),
    };

    let verdict: AiVerdict =
        serde_json::from_str(json).map_err(|e| ExtractError::Parse(e.to_string()))?;
    if !verdict.is_recipe {
        return Err(ExtractError::NotARecipe(
            verdict.reason.unwrap_or_else(|| "no recipe in content".to_string()),
        ));
    }
    serde_json::from_str(json).map_err(|e| ExtractError::Parse(e.to_string()))
}

/// Visible text of an HTML page plus its `og:image`, if any.
fn page_text(html: &str) -> (String, Option<String>) {
    let document = Html::parse_document(html);
    let mut lines = Vec::new();

    if let Ok(selector) = Selector::parse("title, h1, h2, h3, h4, p, li, td") {
        for element in document.select(&selector) {
            let text = element.text().collect::<Vec<_>>().join(" ");
            let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
            if !text.is_empty() {
                lines.push(text);
            }
        }
    }

    let og_image = Selector::parse(r#"meta[property="og:image"]"#)
        .ok()
        .and_then(|s| {
            document
                .select(&s)
                .next()
                .and_then(|e| e.value().attr("content").map(str::to_string))
        });

    (lines.join("\n"), og_image)
}

#[async_trait]
impl RecipeExtractor for WorkersAiClient {
    fn is_available(&self) -> bool {
        !self.account_id.is_empty() && !self.api_token.is_empty()
    }

    async fn extract_from_url(
        &self,
        url: &str,
        options: &ExtractOptions,
        progress: &ProgressFn,
    ) -> Result<ExtractionResult, ExtractError> {
        progress(10, "Fetching page");
        let html = self.fetch_page(url).await?;
        let (text, og_image) = page_text(&html);
        if text.trim().is_empty() {
            return Err(ExtractError::NotARecipe("page has no readable text".to_string()));
        }

        progress(50, "Reading recipe");
        let mut recipe = self.structure(&text, options).await?;
        if recipe.thumbnail_url.is_none() {
            recipe.thumbnail_url = og_image;
        }
        progress(100, "Recipe extracted");
        Ok(recipe)
    }

    async fn extract_from_images(
        &self,
        images: &[ImageInput],
        options: &ExtractOptions,
        progress: &ProgressFn,
    ) -> Result<ExtractionResult, ExtractError> {
        if images.is_empty() {
            return Err(ExtractError::Media("no images".to_string()));
        }

        let mut pages = Vec::with_capacity(images.len());
        for (idx, image) in images.iter().enumerate() {
            let pct = (idx * 70 / images.len()) as u8;
            progress(pct, &format!("Reading photo {} of {}", idx + 1, images.len()));

            let body = serde_json::json!({
                "image": base64::engine::general_purpose::STANDARD.encode(&image.bytes),
                "prompt": "Transcribe all recipe text visible in this photo: title, ingredients with amounts, and steps.",
                "max_tokens": 1024,
            });
            let result: VisionResult = self.run(VISION_MODEL, body).await?;
            pages.push(result.description);
        }

        progress(80, "Structuring recipe");
        let recipe = self.structure(&pages.join("\n\n"), options).await?;
        progress(100, "Recipe extracted");
        Ok(recipe)
    }

    async fn extract_from_video(
        &self,
        media: &MediaRef,
        metadata: &VideoMetadata,
        options: &ExtractOptions,
        progress: &ProgressFn,
    ) -> Result<ExtractionResult, ExtractError> {
        let mut context = Vec::new();
        if let Some(title) = &metadata.title {
            context.push(format!("Video title: {title}"));
        }
        if let Some(description) = &metadata.description {
            context.push(format!("Video description: {description}"));
        }

        match media {
            MediaRef::Local { path, .. } => {
                progress(10, "Transcribing audio");
                let audio = tokio::fs::read(path)
                    .await
                    .map_err(|e| ExtractError::Media(e.to_string()))?;
                let body = serde_json::json!({ "audio": audio });
                let transcript: SpeechResult = self.run(SPEECH_MODEL, body).await?;
                context.push(format!("Transcript: {}", transcript.text));
            }
            MediaRef::Remote { url } => {
                progress(10, "Reading video page");
                let html = self.fetch_page(url).await?;
                let (text, _) = page_text(&html);
                context.push(text);
            }
        }

        progress(60, "Structuring recipe");
        let mut recipe = self.structure(&context.join("\n\n"), options).await?;
        if recipe.thumbnail_url.is_none() {
            recipe.thumbnail_url = metadata.thumbnail_url.clone();
        }
        progress(100, "Recipe extracted");
        Ok(recipe)
    }
}

#[async_trait]
impl RecipeEnricher for WorkersAiClient {
    fn is_available(&self) -> bool {
        RecipeExtractor::is_available(self)
    }

    async fn enrich(
        &self,
        recipe: &ExtractionResult,
        language: Option<&str>,
    ) -> Result<Enrichment, ExtractError> {
        let system = concat!(
            "You estimate nutrition per serving and dietary properties of recipes. ",
            "Return ONLY valid JSON: {\"nutrition\": {calories, protein_g, carbs_g, fat_g, fiber_g, sugar_g, sodium_mg}, ",
            "\"nutrition_confidence\": 0..1, \"dietary\": {vegetarian, vegan, gluten_free, dairy_free, allergens}, ",
            "\"dietary_confidence\": 0..1}."
        );
        let ingredients: Vec<String> = recipe.ingredients.iter().map(|i| i.line()).collect();
        let user = format!(
            "Recipe: {}\nServings: {}\nLanguage: {}\nIngredients:\n{}",
            recipe.title,
            recipe.servings.map(|s| s.to_string()).unwrap_or_else(|| "unknown".into()),
            language.unwrap_or("unknown"),
            ingredients.join("\n")
        );

        let response = self.complete(system, &user).await?;
        let start = response.find('{').unwrap_or(0);
        let end = response.rfind('}').map(|e| e + 1).unwrap_or(response.len());
        let parsed: AiEnrichment = serde_json::from_str(&response[start..end.max(start)])
            .map_err(|e| ExtractError::Parse(e.to_string()))?;

        Ok(Enrichment {
            nutrition: parsed.nutrition.map(|value| Scored {
                value,
                confidence: parsed.nutrition_confidence.clamp(0.0, 1.0),
            }),
            dietary: parsed.dietary.map(|value| Scored {
                value,
                confidence: parsed.dietary_confidence.clamp(0.0, 1.0),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_model_output() {
        let raw = "Here you go:\n```json\n{\"title\": \"Shakshuka\", \"ingredients\": [{\"name\": \"eggs\", \"quantity\": \"4\"}], \"steps\": [\"Simmer\"]}\n```";
        let recipe = parse_recipe_json(raw).unwrap();
        assert_eq!(recipe.title, "Shakshuka");
        assert_eq!(recipe.ingredients[0].quantity.as_deref(), Some("4"));
    }

    #[test]
    fn not_a_recipe_is_reported() {
        let raw = r#"{"is_recipe": false, "reason": "travel vlog"}"#;
        match parse_recipe_json(raw) {
            Err(ExtractError::NotARecipe(reason)) => assert_eq!(reason, "travel vlog"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(parse_recipe_json("sorry, no"), Err(ExtractError::Parse(_))));
    }

    #[test]
    fn page_text_skips_scripts_and_finds_image() {
        let html = r#"<html><head><title>Pie</title>
            <meta property="og:image" content="https://example.com/pie.jpg">
            <script>var x = 1;</script></head>
            <body><h1>Apple   Pie</h1><ul><li>3 apples</li></ul></body></html>"#;
        let (text, image) = page_text(html);
        assert!(text.contains("Apple Pie"));
        assert!(text.contains("3 apples"));
        assert!(!text.contains("var x"));
        assert_eq!(image.as_deref(), Some("https://example.com/pie.jpg"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("crème brûlée", 5), "crème");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
