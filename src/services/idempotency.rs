//! Source identity: URL normalization, idempotency keys and cache hashes.

use reqwest::Url;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Query parameters that never change the content behind a URL.
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "igshid", "si", "feature", "ref", "mc_cid", "mc_eid"];

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SourceError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),
}

/// Canonical form of a source URL, so that trivially different links to the same
/// page share one idempotency key and one cache entry.
pub fn normalize_url(raw: &str) -> Result<String, SourceError> {
    let mut url = Url::parse(raw.trim()).map_err(|e| SourceError::InvalidUrl(e.to_string()))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(SourceError::UnsupportedScheme(url.scheme().to_string()));
    }
    let host = url
        .host_str()
        .ok_or_else(|| SourceError::InvalidUrl("no host".to_string()))?
        .to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();

    if let Some(video_id) = youtube_video_id(&host, &url) {
        return Ok(format!("https://youtube.com/watch?v={video_id}"));
    }

    url.set_host(Some(&host))
        .map_err(|e| SourceError::InvalidUrl(e.to_string()))?;
    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    Ok(url.to_string())
}

fn is_tracking_param(key: &str) -> bool {
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key)
}

fn youtube_video_id(host: &str, url: &Url) -> Option<String> {
    let mut segments = url.path_segments()?;
    match host {
        "youtu.be" => segments.next().filter(|s| !s.is_empty()).map(str::to_string),
        "youtube.com" | "m.youtube.com" => match segments.next() {
            Some("shorts") => segments.next().filter(|s| !s.is_empty()).map(str::to_string),
            Some("watch") => url
                .query_pairs()
                .find(|(k, _)| k == "v")
                .map(|(_, v)| v.into_owned()),
            _ => None,
        },
        _ => None,
    }
}

fn language_or_auto(language: Option<&str>) -> String {
    language
        .map(|l| l.trim().to_lowercase())
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| "auto".to_string())
}

/// Key for url/video jobs: `owner | normalized url | language`.
pub fn source_key(owner_id: Uuid, normalized_url: &str, language: Option<&str>) -> String {
    format!("{owner_id}|{normalized_url}|{}", language_or_auto(language))
}

/// Key for image jobs: `owner | image | sha256(all image bytes)`.
pub fn image_key(owner_id: Uuid, content_hash: &str) -> String {
    format!("{owner_id}|image|{content_hash}")
}

/// SHA-256 over the concatenated bytes of every uploaded image, in upload order.
pub fn content_hash<'a>(images: impl IntoIterator<Item = &'a [u8]>) -> String {
    let mut hasher = Sha256::new();
    for bytes in images {
        hasher.update(bytes);
    }
    format!("{:x}", hasher.finalize())
}

/// Result cache key for a normalized source URL.
pub fn source_hash(normalized_url: &str) -> String {
    format!("{:x}", Sha256::digest(normalized_url.as_bytes()))
}

/// Language used for save-time dedup: the detected one, else the requested one, else
/// empty (unknown), so recipes of unknown language dedup among themselves.
pub fn content_language(detected: Option<&str>, requested: Option<&str>) -> String {
    detected
        .or(requested)
        .map(|l| l.trim().to_lowercase())
        .unwrap_or_default()
}
