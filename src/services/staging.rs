//! Local temp files for uploads and downloaded media.

use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::models::job::StagedImage;

/// Owns staged files and deletes them when dropped, whichever way the job exits.
#[derive(Debug, Default)]
pub struct StagedFiles {
    images: Vec<StagedImage>,
    extra: Vec<PathBuf>,
}

impl StagedFiles {
    pub fn new(images: Vec<StagedImage>) -> Self {
        Self {
            images,
            extra: Vec::new(),
        }
    }

    pub fn images(&self) -> &[StagedImage] {
        &self.images
    }

    pub fn push(&mut self, image: StagedImage) {
        self.images.push(image);
    }

    /// Track an additional path (file or directory) for removal.
    pub fn track(&mut self, path: impl Into<PathBuf>) {
        self.extra.push(path.into());
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.extra.is_empty()
    }
}

impl Drop for StagedFiles {
    fn drop(&mut self) {
        let paths = self
            .images
            .iter()
            .map(|i| i.path.as_path())
            .chain(self.extra.iter().map(PathBuf::as_path));
        for path in paths {
            remove_path(path);
        }
    }
}

fn remove_path(path: &Path) {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed staged file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove staged file"),
    }
}

/// Directory where uploads and downloads are written before a job consumes them.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub async fn ensure(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await
    }

    /// Write one uploaded image to disk.
    pub async fn stage_image(&self, bytes: &[u8], mime_type: &str) -> std::io::Result<StagedImage> {
        let path = self
            .root
            .join(format!("{}.{}", Uuid::new_v4(), extension_for(mime_type)));
        tokio::fs::write(&path, bytes).await?;
        Ok(StagedImage {
            path,
            mime_type: mime_type.to_string(),
        })
    }

    /// Per-job scratch directory for downloaded media.
    pub fn media_dir(&self, job_id: Uuid) -> PathBuf {
        self.root.join(format!("media-{job_id}"))
    }
}

fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        _ => "bin",
    }
}
