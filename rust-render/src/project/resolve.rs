//! Asset resolution: turns a validated spec into something the engine can
//! draw without touching the filesystem again.

use image::RgbaImage;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::model::{ClipSource, ProjectSpec};
use crate::{Error, Result};

/// A project whose image assets are decoded and in memory.
#[derive(Debug, Clone)]
pub struct ResolvedProject {
    pub spec: ProjectSpec,
    /// Decoded images keyed by the asset reference used in the spec.
    pub images: HashMap<String, Arc<RgbaImage>>,
}

impl ResolvedProject {
    pub fn frame_count(&self) -> u64 {
        self.spec.frame_count()
    }
}

/// Resolves asset references against a root directory.
#[derive(Debug, Clone)]
pub struct AssetResolver {
    root: PathBuf,
}

impl AssetResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map an asset reference to a path. Relative references may not leave
    /// the asset root.
    pub fn asset_path(&self, asset: &str) -> Result<PathBuf> {
        let reference = Path::new(asset);
        if reference
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(Error::invalid_project(format!(
                "asset reference '{}' escapes the asset root",
                asset
            )));
        }
        if reference.is_absolute() {
            Ok(reference.to_path_buf())
        } else {
            Ok(self.root.join(reference))
        }
    }

    /// Validate the spec and decode every referenced image.
    ///
    /// Fails with [`Error::AssetNotFound`] naming the first missing asset.
    pub async fn resolve(&self, spec: ProjectSpec) -> Result<ResolvedProject> {
        spec.validate()?;

        let mut images = HashMap::new();
        for clip in spec.layers.iter().flat_map(|l| l.clips.iter()) {
            let ClipSource::Image { asset } = &clip.source else {
                continue;
            };
            if images.contains_key(asset) {
                continue;
            }

            let path = self.asset_path(asset)?;
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => {}
                _ => {
                    return Err(Error::AssetNotFound {
                        asset: asset.clone(),
                    });
                }
            }

            let decoded = decode_image(path.clone(), asset.clone()).await?;
            debug!(
                asset = %asset,
                width = decoded.width(),
                height = decoded.height(),
                "Decoded image asset"
            );
            images.insert(asset.clone(), Arc::new(decoded));
        }

        Ok(ResolvedProject { spec, images })
    }
}

async fn decode_image(path: PathBuf, asset: String) -> Result<RgbaImage> {
    tokio::task::spawn_blocking(move || {
        image::open(&path)
            .map(|img| img.into_rgba8())
            .map_err(|e| Error::invalid_project(format!("asset '{}' could not be decoded: {}", asset, e)))
    })
    .await
    .map_err(|e| Error::Other(format!("Image decode task failed: {}", e)))?
}
