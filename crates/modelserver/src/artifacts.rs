use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Result, ServerError};

/// Object-storage scheme the managed platform hands out in `AIP_STORAGE_URI`.
pub const GCS_SCHEME: &str = "gs://";

/// Fetches model artifacts into a local directory.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Copies whatever `uri` names into `local_dir` and returns the directory.
    async fn download(&self, uri: &str, local_dir: &Path) -> Result<PathBuf>;
}

/// Serves plain paths and `file://` URIs from the local filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalArtifactStore;

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn download(&self, uri: &str, local_dir: &Path) -> Result<PathBuf> {
        let source = local_path(uri)?;
        let dest = local_dir.to_path_buf();
        debug!(source = %source.display(), dest = %dest.display(), "copying artifacts");

        tokio::task::spawn_blocking(move || copy_into(&source, &dest).map(|_| dest))
            .await
            .map_err(|e| ServerError::config(format!("artifact copy task failed: {e}")))?
            .map_err(ServerError::from)
    }
}

fn local_path(uri: &str) -> Result<PathBuf> {
    if let Some(path) = uri.strip_prefix("file://") {
        return Ok(PathBuf::from(path));
    }
    if uri.contains("://") {
        return Err(ServerError::config(format!(
            "LocalArtifactStore cannot fetch {uri:?}; supply an ArtifactStore for that scheme"
        )));
    }
    Ok(PathBuf::from(uri))
}

fn copy_into(source: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    if source.is_file() {
        let name = source.file_name().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "artifact path has no file name")
        })?;
        std::fs::copy(source, dest.join(name))?;
        return Ok(());
    }
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_into(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}
