//! Sandbox image recipes and on-demand image builds
//!
//! Two recipes ship with the crate. Both start from a slim Python base, work
//! in `/app` and drop to the unprivileged `appuser` (uid/gid 1001). The full
//! recipe additionally installs the dependency manifest from the build
//! context; the minimal one needs nothing but the Dockerfile. Neither sets a
//! default command: the runner always supplies one.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ImageConfig;
use crate::sandbox::ContainerEngine;

const FULL_DOCKERFILE: &str = include_str!("../docker/python-sandbox.Dockerfile");
const MINIMAL_DOCKERFILE: &str = include_str!("../docker/python-sandbox-minimal.Dockerfile");

/// File name the full recipe copies into the image
const STAGED_MANIFEST: &str = "requirements.txt";

/// Which Dockerfile to build the sandbox image from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageRecipe {
    /// Installs `requirements.txt` from the build context
    #[default]
    Full,
    /// Base interpreter only
    Minimal,
}

impl ImageRecipe {
    pub fn dockerfile(&self) -> &'static str {
        match self {
            ImageRecipe::Full => FULL_DOCKERFILE,
            ImageRecipe::Minimal => MINIMAL_DOCKERFILE,
        }
    }

    pub fn requires_manifest(&self) -> bool {
        matches!(self, ImageRecipe::Full)
    }
}

impl fmt::Display for ImageRecipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageRecipe::Full => write!(f, "full"),
            ImageRecipe::Minimal => write!(f, "minimal"),
        }
    }
}

impl FromStr for ImageRecipe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "full" => Ok(ImageRecipe::Full),
            "minimal" => Ok(ImageRecipe::Minimal),
            other => Err(format!(
                "unknown image recipe '{}' (expected 'full' or 'minimal')",
                other
            )),
        }
    }
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("dependency manifest '{manifest}' not found in build context {}", .dir.display())]
    MissingManifest { manifest: String, dir: PathBuf },
    #[error("failed to stage build context: {0}")]
    Io(#[from] std::io::Error),
    #[error("Docker Build Error: {0}")]
    Build(String),
    #[error("Docker error: {0}")]
    Engine(String),
}

/// A private, staged build directory containing `Dockerfile` and,
/// for the full recipe, the dependency manifest. Removed on drop.
#[derive(Debug)]
pub struct BuildContext {
    dir: PathBuf,
}

impl BuildContext {
    pub fn prepare(
        recipe: ImageRecipe,
        source_dir: &Path,
        manifest: &str,
    ) -> Result<Self, ImageError> {
        let manifest_path = source_dir.join(manifest);
        if recipe.requires_manifest() && !manifest_path.is_file() {
            return Err(ImageError::MissingManifest {
                manifest: manifest.to_string(),
                dir: source_dir.to_path_buf(),
            });
        }

        let dir = std::env::temp_dir().join(format!("greenbox-build-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir)?;
        let context = Self { dir };

        std::fs::write(context.dir.join("Dockerfile"), recipe.dockerfile())?;
        if recipe.requires_manifest() {
            std::fs::copy(&manifest_path, context.dir.join(STAGED_MANIFEST))?;
        }

        debug!(
            "Image: staged {} recipe in {}",
            recipe,
            context.dir.display()
        );
        Ok(context)
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }
}

impl Drop for BuildContext {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            warn!(
                "Image: could not remove build context {}: {}",
                self.dir.display(),
                e
            );
        }
    }
}

/// Makes sure the sandbox image exists, building it when missing
pub struct ImageManager {
    engine: Arc<dyn ContainerEngine>,
    config: ImageConfig,
}

impl ImageManager {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: ImageConfig) -> Self {
        Self { engine, config }
    }

    /// Returns `true` if the image had to be built
    pub async fn ensure(&self, tag: &str) -> Result<bool, ImageError> {
        let present = self
            .engine
            .image_exists(tag)
            .await
            .map_err(|e| ImageError::Engine(e.to_string()))?;

        if present {
            debug!("Image: '{}' found", tag);
            return Ok(false);
        }

        info!("Image: '{}' not found, building", tag);
        self.build(tag).await?;
        Ok(true)
    }

    /// Build the configured recipe unconditionally
    pub async fn build(&self, tag: &str) -> Result<(), ImageError> {
        let context = BuildContext::prepare(
            self.config.recipe,
            &self.config.build_context,
            &self.config.manifest,
        )?;

        self.engine
            .build_image(context.path(), tag)
            .await
            .map_err(|e| ImageError::Build(e.to_string()))?;

        info!("Image: built '{}' ({} recipe)", tag, self.config.recipe);
        Ok(())
    }
}
