//! Video acquisition: platform detection and `yt-dlp` driven downloads.

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use strum::{Display, EnumString};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

use crate::services::extractor::{ProgressFn, VideoMetadata};

const METADATA_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Platform {
    YouTube,
    TikTok,
    Instagram,
    Facebook,
    Other,
}

impl Platform {
    pub fn detect(url: &str) -> Self {
        let Some(host) = Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_lowercase)) else {
            return Platform::Other;
        };
        let host = host.strip_prefix("www.").unwrap_or(&host);
        let host = host.strip_prefix("m.").unwrap_or(host);
        match host {
            "youtube.com" | "youtu.be" => Platform::YouTube,
            "tiktok.com" | "vm.tiktok.com" => Platform::TikTok,
            "instagram.com" => Platform::Instagram,
            "facebook.com" | "fb.watch" => Platform::Facebook,
            _ => Platform::Other,
        }
    }

    /// How media for this platform reaches the extractor.
    pub fn acquisition(self, native: &[String]) -> Acquisition {
        let name = self.to_string();
        if self != Platform::Other && native.iter().any(|p| p.eq_ignore_ascii_case(&name)) {
            Acquisition::Remote
        } else {
            Acquisition::Local
        }
    }
}

/// `Remote`: the extractor reads the canonical URL itself. `Local`: download first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    Remote,
    Local,
}

#[derive(Debug, Clone)]
pub struct DownloadedMedia {
    pub path: PathBuf,
    pub mime_type: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("Downloader binary not available")]
    Unavailable,

    #[error("Failed to run downloader: {0}")]
    Io(#[from] std::io::Error),

    #[error("Downloader exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("Downloader timed out")]
    Timeout,

    #[error("Unexpected downloader output: {0}")]
    Output(String),
}

#[async_trait]
pub trait VideoDownloader: Send + Sync {
    fn is_available(&self) -> bool;

    async fn fetch_metadata(&self, url: &str) -> Result<VideoMetadata, DownloadError>;

    /// Download the audio track into `dest_dir`. The caller owns `dest_dir` and removes it.
    async fn download(
        &self,
        url: &str,
        dest_dir: &Path,
        progress: &ProgressFn,
    ) -> Result<DownloadedMedia, DownloadError>;
}

/// [`VideoDownloader`] backed by the `yt-dlp` CLI.
pub struct YtDlpDownloader {
    binary: PathBuf,
    available: bool,
}

#[derive(Deserialize)]
struct YtDlpInfo {
    title: Option<String>,
    description: Option<String>,
    uploader: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
}

impl YtDlpDownloader {
    /// Probe `binary --version` once at start-up.
    pub async fn detect(binary: impl Into<PathBuf>) -> Self {
        let binary = binary.into();
        let available = Command::new(&binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false);

        if available {
            tracing::info!(binary = %binary.display(), "yt-dlp available");
        } else {
            tracing::warn!(binary = %binary.display(), "yt-dlp not found; video jobs will fail");
        }
        Self { binary, available }
    }
}

#[async_trait]
impl VideoDownloader for YtDlpDownloader {
    fn is_available(&self) -> bool {
        self.available
    }

    async fn fetch_metadata(&self, url: &str) -> Result<VideoMetadata, DownloadError> {
        if !self.available {
            return Err(DownloadError::Unavailable);
        }
        let mut cmd = Command::new(&self.binary);
        cmd.args(["--dump-json", "--no-playlist", "--skip-download", url])
            .kill_on_drop(true)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = tokio::time::timeout(METADATA_TIMEOUT, cmd.output())
            .await
            .map_err(|_| DownloadError::Timeout)??;
        if !output.status.success() {
            return Err(DownloadError::Failed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let info: YtDlpInfo = serde_json::from_slice(&output.stdout)
            .map_err(|e| DownloadError::Output(e.to_string()))?;
        Ok(VideoMetadata {
            title: info.title,
            description: info.description,
            uploader: info.uploader,
            duration_secs: info.duration,
            thumbnail_url: info.thumbnail,
        })
    }

    async fn download(
        &self,
        url: &str,
        dest_dir: &Path,
        progress: &ProgressFn,
    ) -> Result<DownloadedMedia, DownloadError> {
        if !self.available {
            return Err(DownloadError::Unavailable);
        }
        tokio::fs::create_dir_all(dest_dir).await?;
        let template = dest_dir.join("audio.%(ext)s");

        let mut cmd = Command::new(&self.binary);
        cmd.args(["-x", "--audio-format", "mp3", "--newline", "--no-playlist", "-o"])
            .arg(&template)
            .arg(url)
            .kill_on_drop(true)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                if let Some(pct) = parse_progress_line(&line) {
                    progress(pct, "Downloading video");
                }
            }
        }

        let status = child.wait().await?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        if !status.success() {
            return Err(DownloadError::Failed {
                code: status.code(),
                stderr: stderr.trim().to_string(),
            });
        }

        let path = dest_dir.join("audio.mp3");
        if !tokio::fs::try_exists(&path).await? {
            return Err(DownloadError::Output(format!(
                "expected {} after download",
                path.display()
            )));
        }
        Ok(DownloadedMedia {
            path,
            mime_type: "audio/mpeg".to_string(),
        })
    }
}

/// Percentage from a `[download]  42.3% of ...` line.
fn parse_progress_line(line: &str) -> Option<u8> {
    let rest = line.trim_start().strip_prefix("[download]")?;
    let pct = rest.split_whitespace().next()?.strip_suffix('%')?;
    let value: f64 = pct.parse().ok()?;
    Some(value.clamp(0.0, 100.0) as u8)
}
