use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read '{path}': {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to write '{path}': {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to move '{from}' to '{to}': {source}")]
    Rename {
        from:   PathBuf,
        to:     PathBuf,
        source: io::Error,
    },

    #[error("failed to remove '{path}': {source}")]
    Remove { path: PathBuf, source: io::Error },

    #[error("failed to query free space at '{path}': {source}")]
    FreeSpace { path: PathBuf, source: nix::Error },

    #[error("path not found: {0}")]
    NotFound(PathBuf),

    #[error("'{0}' has no parent directory")]
    NoParent(PathBuf),

    #[error("'{0}' has no file name")]
    NoFileName(PathBuf),

    #[error("failed to walk '{path}': {source}")]
    Walk {
        path:   PathBuf,
        source: walkdir::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn read(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Read {
            path: path.into(),
            source,
        }
    }

    pub fn write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }

    pub fn remove(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Remove {
            path: path.into(),
            source,
        }
    }
}
