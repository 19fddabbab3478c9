//! Rename-based rollback for directories about to be replaced.

use std::path::{Path, PathBuf};

use crate::{Error, ReplaceDirOptions, Result, replace_dir};

/// Keeps a pre-existing directory aside, under a sibling name, until the
/// operation that replaces it either commits or rolls back.
///
/// Moving aside is a rename, so restoring is exact and cheap. Dropping an
/// unresolved guard rolls back.
#[derive(Debug)]
pub struct RollbackGuard {
    original: PathBuf,
    sidecar:  PathBuf,
    resolved: bool,
}

impl RollbackGuard {
    /// Move `original` to `<name>_backup_<timestamp>` next to it.
    ///
    /// Returns `Ok(None)` when there is nothing to protect.
    pub fn move_aside(original: impl AsRef<Path>) -> Result<Option<Self>> {
        let original = original.as_ref();
        if std::fs::symlink_metadata(original).is_err() {
            return Ok(None);
        }

        let sidecar = sidecar_path(original)?;
        replace_dir(original, &sidecar, ReplaceDirOptions::new())?;
        tracing::info!(
            original = %original.display(),
            sidecar = %sidecar.display(),
            "moved existing directory aside"
        );

        Ok(Some(Self {
            original: original.to_path_buf(),
            sidecar,
            resolved: false,
        }))
    }

    pub fn original(&self) -> &Path { &self.original }

    pub fn sidecar(&self) -> &Path { &self.sidecar }

    /// The replacement succeeded: delete the saved copy.
    pub fn commit(mut self) -> Result<()> {
        self.resolved = true;
        std::fs::remove_dir_all(&self.sidecar).map_err(|e| Error::remove(&self.sidecar, e))
    }

    /// The replacement failed: delete whatever now sits at the original
    /// location and move the saved copy back.
    pub fn restore(mut self) -> Result<()> {
        self.resolved = true;
        self.put_back()
    }

    fn put_back(&self) -> Result<()> {
        if std::fs::symlink_metadata(&self.original).is_ok() {
            remove_any(&self.original)?;
        }
        replace_dir(&self.sidecar, &self.original, ReplaceDirOptions::new())?;
        tracing::info!(original = %self.original.display(), "restored directory from sidecar");
        Ok(())
    }
}

impl Drop for RollbackGuard {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        if let Err(e) = self.put_back() {
            tracing::warn!(
                original = %self.original.display(),
                sidecar = %self.sidecar.display(),
                error = %e,
                "failed to restore directory while dropping rollback guard"
            );
        }
    }
}

/// Remove a file, symlink or directory tree.
pub fn remove_any(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::read(path, e)),
    };
    let result = if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    result.map_err(|e| Error::remove(path, e))
}

fn sidecar_path(original: &Path) -> Result<PathBuf> {
    let parent = original
        .parent()
        .ok_or_else(|| Error::NoParent(original.to_path_buf()))?;
    let name = original
        .file_name()
        .ok_or_else(|| Error::NoFileName(original.to_path_buf()))?
        .to_string_lossy();
    let stamp = chrono::Local::now().format("%Y%m%d%H%M%S");

    let base = format!("{name}_backup_{stamp}");
    let mut candidate = parent.join(&base);
    let mut n = 1;
    while std::fs::symlink_metadata(&candidate).is_ok() {
        candidate = parent.join(format!("{base}_{n}"));
        n += 1;
    }
    Ok(candidate)
}
