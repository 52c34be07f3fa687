use std::path::{Path, PathBuf};

use walkdir::WalkDir;

pub fn absolute_path(path: PathBuf) -> crate::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

pub fn ensure_dir(path: &Path) -> crate::Result<()> {
    std::fs::create_dir_all(path).map_err(|error| {
        crate::Error::GenericError(format!("Cannot create {}: {error}", path.display()))
    })
}

/// Copies `source` (a file or a directory tree) into `target`, overwriting existing
/// files. Returns the number of copied files.
pub fn copy_tree(source: &Path, target: &Path) -> crate::Result<u64> {
    if source.is_file() {
        if let Some(parent) = target.parent() {
            ensure_dir(parent)?;
        }
        std::fs::copy(source, target)?;
        return Ok(1);
    }
    let mut copied = 0;
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|error| crate::Error::GenericError(error.to_string()))?;
        let destination = target.join(relative);
        if entry.file_type().is_dir() {
            ensure_dir(&destination)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &destination)?;
            copied += 1;
        }
    }
    Ok(copied)
}
