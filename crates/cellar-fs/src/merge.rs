use std::path::Path;

use crate::{Error, ReplaceDirOptions, Result, replace_dir};

/// Move the contents of `src` into `dest`, then remove `src`.
///
/// When `dest` does not exist this is a plain rename. Otherwise entries are
/// moved one by one and directories present on both sides are merged
/// recursively; for files present on both sides `dest` wins and the copy in
/// `src` is discarded.
pub fn merge_dir(src: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<()> {
    let src = src.as_ref();
    let dest = dest.as_ref();

    if std::fs::symlink_metadata(dest).is_err() {
        return replace_dir(src, dest, ReplaceDirOptions::new());
    }

    let entries = std::fs::read_dir(src).map_err(|e| Error::read(src, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::read(src, e))?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        let from_is_dir = entry.file_type().map_err(|e| Error::read(&from, e))?.is_dir();

        match std::fs::symlink_metadata(&to) {
            Err(_) => {
                std::fs::rename(&from, &to).map_err(|e| Error::Rename {
                    from:   from.clone(),
                    to:     to.clone(),
                    source: e,
                })?;
            }
            Ok(meta) if meta.is_dir() && from_is_dir => merge_dir(&from, &to)?,
            Ok(_) => {
                tracing::debug!(path = %from.display(), "merge conflict, keeping destination");
                crate::remove_any(&from)?;
            }
        }
    }

    std::fs::remove_dir(src).map_err(|e| Error::remove(src, e))
}
