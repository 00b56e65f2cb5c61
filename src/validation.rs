//! Input path validation
//!
//! Filenames arrive from upstream callers. They are canonicalized to an
//! absolute path and rejected if any parent-directory or home marker survives.

use std::path::{Component, Path, PathBuf};

use crate::error::{RawError, Result};

/// Canonicalize an input file path and reject traversal markers
pub async fn canonicalize_input(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    if path.as_os_str().is_empty() {
        return Err(RawError::PathValidation("empty path".to_string()));
    }
    if has_home_marker(path) {
        return Err(RawError::PathValidation(format!(
            "home directory marker in {}",
            path.display()
        )));
    }

    let canonical = tokio::fs::canonicalize(path).await.map_err(|e| {
        RawError::PathValidation(format!("cannot resolve {}: {}", path.display(), e))
    })?;
    check_canonical(&canonical)?;

    let metadata = tokio::fs::metadata(&canonical).await?;
    if !metadata.is_file() {
        return Err(RawError::PathValidation(format!(
            "{} is not a regular file",
            canonical.display()
        )));
    }
    Ok(canonical)
}

/// Reject a resolved path that still carries `..` or `~`
pub fn check_canonical(path: &Path) -> Result<()> {
    if !path.is_absolute() {
        return Err(RawError::PathValidation(format!("{} is not absolute", path.display())));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) || has_home_marker(path) {
        return Err(RawError::PathValidation(format!(
            "traversal marker survives in {}",
            path.display()
        )));
    }
    Ok(())
}

fn has_home_marker(path: &Path) -> bool {
    path.components().any(|c| match c {
        Component::Normal(part) => part.to_string_lossy().starts_with('~'),
        _ => false,
    })
}

/// Lowercased extension without the dot
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_ascii_lowercase())
}
