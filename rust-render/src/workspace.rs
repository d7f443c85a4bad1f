//! Per-job scratch directories.
//!
//! Every job gets a fresh directory under the workspace root. The directory
//! is removed when the job ends; [`TempWorkspace`] also removes it on drop so
//! a job future that is cancelled or times out cannot leave it behind.

use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::{Error, Result};

/// Allocates job workspaces under a single root.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a uniquely named directory `<root>/<prefix>XXXXXX`.
    pub async fn create(&self, prefix: &str) -> Result<TempWorkspace> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Error::io_path("creating workspace root", &self.root, e))?;

        let root = self.root.clone();
        let prefix = prefix.to_string();
        let path = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(&prefix)
                .tempdir_in(&root)
                .map(|dir| dir.keep())
                .map_err(|e| Error::io_path("creating workspace in", &root, e))
        })
        .await
        .map_err(|e| Error::Other(format!("Workspace task failed: {}", e)))??;

        debug!(path = %path.display(), "Created job workspace");
        Ok(TempWorkspace {
            path,
            destroyed: false,
        })
    }
}

/// A job-scoped directory, removed exactly once.
#[derive(Debug)]
pub struct TempWorkspace {
    path: PathBuf,
    destroyed: bool,
}

impl TempWorkspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: impl AsRef<Path>) -> PathBuf {
        self.path.join(name)
    }

    /// Remove the directory. Errors are logged, never returned.
    pub async fn destroy(mut self) {
        self.destroyed = true;
        if let Err(e) = destroy(&self.path).await {
            warn!(path = %self.path.display(), error = %e, "Failed to remove job workspace");
        }
    }
}

impl Drop for TempWorkspace {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed job workspace on drop"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to remove job workspace on drop")
            }
        }
    }
}

/// Recursively remove `path`. A path that is already gone is not an error.
pub async fn destroy(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "Removed job workspace");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_workspaces_are_unique() {
        let root = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(root.path().join("jobs"));

        let a = manager.create("job-").await.unwrap();
        let b = manager.create("job-").await.unwrap();

        assert_ne!(a.path(), b.path());
        assert!(a.path().is_dir());
        assert!(b.path().starts_with(root.path().join("jobs")));
        assert!(
            a.path()
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("job-")
        );
    }

    #[tokio::test]
    async fn test_destroy_removes_contents() {
        let root = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(root.path());
        let ws = manager.create("job-").await.unwrap();
        let path = ws.path().to_path_buf();
        std::fs::create_dir_all(ws.join("frames")).unwrap();
        std::fs::write(ws.join("frames/out.bin"), b"partial").unwrap();

        ws.destroy().await;

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let root = TempDir::new().unwrap();
        let missing = root.path().join("never-created");

        destroy(&missing).await.unwrap();
        destroy(&missing).await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_removes_directory() {
        let root = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(root.path());
        let ws = manager.create("job-").await.unwrap();
        let path = ws.path().to_path_buf();

        drop(ws);

        assert!(!path.exists());
    }
}
