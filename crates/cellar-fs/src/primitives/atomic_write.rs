use crate::{Error, Result};
use std::fs;
use std::path::Path;

#[derive(Clone, Copy, Debug, Default)]
pub struct AtomicWriteOptions {
    pub permissions: Option<u32>,
    pub sync:        bool,
}

impl AtomicWriteOptions {
    pub fn new() -> Self { Self::default() }

    /// Unix mode bits applied to the file before it replaces the target.
    pub fn permissions(mut self, mode: u32) -> Self {
        self.permissions = Some(mode);
        self
    }

    pub fn sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// Keep the mode bits of whatever currently lives at `path`.
    #[cfg(unix)]
    pub fn preserve_from(self, path: &Path) -> Self {
        use std::os::unix::fs::PermissionsExt;
        match fs::metadata(path) {
            Ok(meta) => self.permissions(meta.permissions().mode() & 0o7777),
            Err(_) => self,
        }
    }

    #[cfg(not(unix))]
    pub fn preserve_from(self, _path: &Path) -> Self { self }
}

/// Write `content` to a sibling temp file and rename it over `path`.
///
/// Readers observe either the old or the new content, never a torn write.
pub fn atomic_write(
    path: impl AsRef<Path>,
    content: &[u8],
    options: AtomicWriteOptions,
) -> Result<()> {
    let path = path.as_ref();
    let parent = path
        .parent()
        .ok_or_else(|| Error::NoParent(path.to_path_buf()))?;

    let tmp_path = parent.join(format!(".tmp.{}.cellar", uuid::Uuid::new_v4()));

    let staged = stage(&tmp_path, content, options);
    if let Err(e) = staged {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }

    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        Error::write(path, e)
    })
}

fn stage(tmp_path: &Path, content: &[u8], options: AtomicWriteOptions) -> Result<()> {
    fs::write(tmp_path, content).map_err(|e| Error::write(tmp_path, e))?;

    #[cfg(unix)]
    if let Some(mode) = options.permissions {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp_path, fs::Permissions::from_mode(mode))
            .map_err(|e| Error::write(tmp_path, e))?;
    }

    if options.sync {
        let file = fs::File::open(tmp_path).map_err(|e| Error::write(tmp_path, e))?;
        file.sync_all().map_err(|e| Error::write(tmp_path, e))?;
    }

    Ok(())
}

pub fn atomic_read(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    fs::read(path).map_err(|e| Error::read(path, e))
}
