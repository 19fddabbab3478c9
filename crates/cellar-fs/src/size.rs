//! Directory sizing and free-space queries.

use std::path::Path;

use walkdir::WalkDir;

use crate::{Error, Result};

/// Sum of the lengths of all regular files below `path`.
///
/// Symlinks are neither followed nor counted, which keeps the figure
/// consistent with what the archiver stores (the link, not its target).
pub fn directory_size(path: impl AsRef<Path>) -> Result<u64> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(Error::NotFound(path.to_path_buf()));
    }

    let mut total = 0u64;
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(|e| Error::Walk {
            path:   path.to_path_buf(),
            source: e,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let meta = entry.metadata().map_err(|e| Error::Walk {
            path:   entry.path().to_path_buf(),
            source: e,
        })?;
        total = total.saturating_add(meta.len());
    }
    Ok(total)
}

/// Bytes available to an unprivileged user on the filesystem holding `path`.
///
/// A path that does not exist yet is resolved to its nearest existing
/// ancestor, so a destination directory can be checked before creation.
pub fn available_space(path: impl AsRef<Path>) -> Result<u64> {
    let path = path.as_ref();
    let probe = path
        .ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .ok_or_else(|| Error::NotFound(path.to_path_buf()))?;

    let stat = nix::sys::statvfs::statvfs(probe).map_err(|e| Error::FreeSpace {
        path:   probe.to_path_buf(),
        source: e,
    })?;

    #[allow(clippy::unnecessary_cast)]
    let bytes = (stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64);
    Ok(bytes)
}
