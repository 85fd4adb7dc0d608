use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::db::PoolSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Base URL under which this instance is reachable, used for export links.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    /// PostgreSQL connection string
    pub database_url: String,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// Redis connection string for the result cache and cancellation channel
    pub redis_url: String,

    /// Cloudflare account ID
    pub cf_account_id: String,

    /// Cloudflare Workers AI API token
    pub cf_api_token: String,

    /// Concurrent video jobs per instance.
    #[serde(default = "default_heavy_job_concurrency")]
    pub heavy_job_concurrency: usize,

    /// Concurrent url/image/conversion jobs per instance.
    #[serde(default = "default_light_job_concurrency")]
    pub light_job_concurrency: usize,

    #[serde(default = "default_light_job_timeout_secs")]
    pub light_job_timeout_secs: u64,

    #[serde(default = "default_heavy_job_timeout_secs")]
    pub heavy_job_timeout_secs: u64,

    /// Enrichment fields below this confidence are dropped.
    #[serde(default = "default_enrichment_min_confidence")]
    pub enrichment_min_confidence: f64,

    /// Redis pub/sub channel carrying cancelled job ids.
    #[serde(default = "default_cancel_channel")]
    pub cancel_channel: String,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Directory for uploaded images and downloaded media.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// Directory served under `/exports`.
    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,

    /// Exported files older than this are deleted.
    #[serde(default = "default_export_retention_secs")]
    pub export_retention_secs: u64,

    #[serde(default = "default_yt_dlp_path")]
    pub yt_dlp_path: String,

    /// Comma-separated platforms the AI model reads directly by URL (e.g. "youtube").
    #[serde(default)]
    pub native_video_platforms: String,

    #[serde(default = "default_free_monthly_extractions")]
    pub free_monthly_extractions: i64,

    #[serde(default = "default_premium_monthly_extractions")]
    pub premium_monthly_extractions: i64,

    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_public_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_db_max_connections() -> u32 {
    20
}

fn default_db_min_connections() -> u32 {
    2
}

fn default_heavy_job_concurrency() -> usize {
    2
}

fn default_light_job_concurrency() -> usize {
    8
}

fn default_light_job_timeout_secs() -> u64 {
    5 * 60
}

fn default_heavy_job_timeout_secs() -> u64 {
    30 * 60
}

fn default_enrichment_min_confidence() -> f64 {
    0.6
}

fn default_cancel_channel() -> String {
    "recipe_extract:cancel".to_string()
}

fn default_cache_ttl_secs() -> u64 {
    30 * 24 * 60 * 60
}

fn default_staging_dir() -> PathBuf {
    std::env::temp_dir().join("recipe-extract")
}

fn default_export_dir() -> PathBuf {
    PathBuf::from("exports")
}

fn default_export_retention_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_yt_dlp_path() -> String {
    "yt-dlp".to_string()
}

fn default_free_monthly_extractions() -> i64 {
    10
}

fn default_premium_monthly_extractions() -> i64 {
    200
}

fn default_max_upload_bytes() -> usize {
    20 * 1024 * 1024
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_connections: self.db_max_connections,
            min_connections: self.db_min_connections,
        }
    }

    pub fn light_job_timeout(&self) -> Duration {
        Duration::from_secs(self.light_job_timeout_secs)
    }

    pub fn heavy_job_timeout(&self) -> Duration {
        Duration::from_secs(self.heavy_job_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn export_retention(&self) -> Duration {
        Duration::from_secs(self.export_retention_secs)
    }

    pub fn native_video_platforms(&self) -> Vec<String> {
        self.native_video_platforms
            .split(',')
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect()
    }
}
