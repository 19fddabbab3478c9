use std::fmt;
use std::path::{Path, PathBuf};

use cellar_pipeline::CancellationToken;

use crate::{ArchiveFormat, Result, TransformRule};

/// One directory tree to add: `entry` resolved relative to `base`, stored
/// under the name `entry` before transforms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSource {
    pub base:  PathBuf,
    pub entry: String,
}

/// Everything needed to write one archive.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub output:     PathBuf,
    pub format:     ArchiveFormat,
    pub sources:    Vec<ArchiveSource>,
    pub transforms: Vec<TransformRule>,
}

impl CreateRequest {
    pub fn new(output: impl Into<PathBuf>, format: ArchiveFormat) -> Self {
        Self {
            output: output.into(),
            format,
            sources: Vec::new(),
            transforms: Vec::new(),
        }
    }

    pub fn source(mut self, base: impl Into<PathBuf>, entry: impl Into<String>) -> Self {
        self.sources.push(ArchiveSource {
            base:  base.into(),
            entry: entry.into(),
        });
        self
    }

    pub fn transform(mut self, rule: TransformRule) -> Self {
        self.transforms.push(rule);
        self
    }
}

/// Cancellation and progress plumbing for one archive operation.
pub struct ArchiveContext<'a> {
    token:          &'a CancellationToken,
    on_progress:    Option<&'a dyn Fn(f64)>,
    expected_bytes: Option<u64>,
}

impl<'a> ArchiveContext<'a> {
    pub fn new(token: &'a CancellationToken) -> Self {
        Self {
            token,
            on_progress: None,
            expected_bytes: None,
        }
    }

    pub fn on_progress(mut self, callback: &'a dyn Fn(f64)) -> Self {
        self.on_progress = Some(callback);
        self
    }

    /// Uncompressed size the operation is expected to stream, used as the
    /// denominator for progress.
    pub fn expected_bytes(mut self, bytes: u64) -> Self {
        self.expected_bytes = Some(bytes);
        self
    }

    pub fn token(&self) -> &CancellationToken { self.token }

    pub fn is_cancelled(&self) -> bool { self.token.is_cancelled() }

    pub fn expected(&self) -> Option<u64> { self.expected_bytes }

    pub fn report(&self, fraction: f64) {
        if let Some(callback) = self.on_progress {
            callback(fraction);
        }
    }
}

impl fmt::Debug for ArchiveContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveContext")
            .field("cancelled", &self.token.is_cancelled())
            .field("expected_bytes", &self.expected_bytes)
            .finish_non_exhaustive()
    }
}

/// Archive creation, extraction and inspection.
///
/// Implementations must honour cancellation during `create` and `extract`
/// and leave no partial output behind when they fail or are cancelled.
pub trait Archiver: Send + Sync {
    fn create(&self, request: &CreateRequest, ctx: &ArchiveContext<'_>) -> Result<()>;

    fn extract(&self, archive: &Path, destination: &Path, ctx: &ArchiveContext<'_>) -> Result<()>;

    /// Sum of the sizes of regular files stored in `archive`.
    fn uncompressed_size(&self, archive: &Path) -> Result<u64>;

    /// First path component of the first member of `archive`.
    fn top_level_entry(&self, archive: &Path) -> Result<String>;
}
