//! Code workspace — where downloaded repositories live and how they are removed

use anyhow::{Result, bail};
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

use crate::config::ConfigError;

/// Resolve a client-supplied relative directory under the workspace root.
///
/// `None` or an empty string means the root itself. Absolute paths and
/// `..` components are rejected so a client cannot place code elsewhere.
pub fn resolve_code_base(root: &Path, relative: Option<&str>) -> Result<PathBuf, ConfigError> {
    let Some(relative) = relative.map(str::trim).filter(|r| !r.is_empty()) else {
        return Ok(root.to_path_buf());
    };

    let rel = Path::new(relative);
    for component in rel.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(ConfigError::Invalid {
                    key: "user_code_dir_relative",
                    reason: format!("'{}' must be a relative path inside the workspace", relative),
                });
            }
        }
    }

    Ok(root.join(rel))
}

/// Recursively delete a directory.
///
/// Returns `Ok(false)` if nothing existed at `path`, `Ok(true)` once deleted.
/// Refuses to delete a regular file.
pub async fn remove_dir_force(path: &Path) -> Result<bool> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("Directory '{}' does not exist, nothing to delete", path.display());
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    };

    if !metadata.is_dir() {
        bail!("'{}' is not a directory", path.display());
    }

    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            info!("Deleted directory '{}'", path.display());
            Ok(true)
        }
        Err(e) => {
            warn!("Error deleting directory '{}': {}", path.display(), e);
            Err(e.into())
        }
    }
}
