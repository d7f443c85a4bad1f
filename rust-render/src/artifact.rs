//! Artifact handoff: moves the encoded file out of the job workspace.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::export::{EncoderSettings, ExportOutput};
use crate::{Error, Result};

/// Where a finished render lives, plus what it contains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactReference {
    /// Filesystem path under the artifact root.
    pub location: String,
    pub size_bytes: u64,
    pub frames: u64,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Stores artifacts in a local directory, one file per job.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Move `output` to `<root>/<job_id>.<ext>`.
    pub async fn store(
        &self,
        job_id: &str,
        output: &ExportOutput,
        settings: &EncoderSettings,
    ) -> Result<ArtifactReference> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Error::io_path("creating artifact directory", &self.root, e))?;

        let file_name = match output.path.extension() {
            Some(ext) => format!("{}.{}", job_id, ext.to_string_lossy()),
            None => job_id.to_string(),
        };
        let dest = self.root.join(file_name);
        relocate(&output.path, &dest).await?;

        let dest = tokio::fs::canonicalize(&dest).await.unwrap_or(dest);
        info!(
            job_id = %job_id,
            location = %dest.display(),
            size_bytes = output.size_bytes,
            "Artifact stored"
        );

        Ok(ArtifactReference {
            location: dest.to_string_lossy().into_owned(),
            size_bytes: output.size_bytes,
            frames: output.frames,
            width: settings.width,
            height: settings.height,
            fps: settings.fps,
        })
    }

    /// Remove a stored artifact whose job did not end completed. Missing
    /// files are fine; locations outside the root are never touched.
    pub async fn discard(&self, artifact: &ArtifactReference) -> Result<()> {
        let location = Path::new(&artifact.location);
        let root = tokio::fs::canonicalize(&self.root)
            .await
            .unwrap_or_else(|_| self.root.clone());
        if !location.starts_with(&root) {
            warn!(location = %location.display(), "Refusing to discard artifact outside the artifact root");
            return Ok(());
        }

        match tokio::fs::remove_file(location).await {
            Ok(()) => {
                info!(location = %location.display(), "Discarded artifact");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io_path("removing", location, e)),
        }
    }
}

/// Rename, falling back to copy + remove across filesystems.
async fn relocate(from: &Path, to: &Path) -> Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            debug!(
                from = %from.display(),
                to = %to.display(),
                error = %rename_err,
                "Rename failed, copying artifact instead"
            );
            tokio::fs::copy(from, to)
                .await
                .map_err(|e| Error::io_path("copying artifact to", to, e))?;
            tokio::fs::remove_file(from)
                .await
                .map_err(|e| Error::io_path("removing", from, e))?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_store_moves_file_out_of_workspace() {
        let workspace = TempDir::new().unwrap();
        let artifacts = TempDir::new().unwrap();
        let encoded = workspace.path().join("output.mp4");
        std::fs::write(&encoded, b"video").unwrap();

        let store = LocalArtifactStore::new(artifacts.path().join("out"));
        let reference = store
            .store(
                "job-1",
                &ExportOutput {
                    path: encoded.clone(),
                    size_bytes: 5,
                    frames: 3,
                },
                &EncoderSettings {
                    width: 1,
                    height: 1,
                    fps: 1,
                },
            )
            .await
            .unwrap();

        assert!(!encoded.exists());
        assert!(reference.location.ends_with("job-1.mp4"));
        assert_eq!(std::fs::read(&reference.location).unwrap(), b"video");
        assert_eq!(reference.frames, 3);

        store.discard(&reference).await.unwrap();
        assert!(!Path::new(&reference.location).exists());
        // Already gone.
        store.discard(&reference).await.unwrap();
    }

    #[tokio::test]
    async fn test_discard_ignores_paths_outside_root() {
        let dir = TempDir::new().unwrap();
        let outside = dir.path().join("keep.mp4");
        std::fs::write(&outside, b"video").unwrap();

        let store = LocalArtifactStore::new(dir.path().join("out"));
        let reference = ArtifactReference {
            location: outside.to_string_lossy().into_owned(),
            size_bytes: 5,
            frames: 1,
            width: 1,
            height: 1,
            fps: 1,
        };
        store.discard(&reference).await.unwrap();
        assert!(outside.exists());
    }
}
