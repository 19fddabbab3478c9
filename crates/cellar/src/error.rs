use std::io;
use std::path::PathBuf;

use cellar_pipeline::{BoxError, Outcome, StepError};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("preflight check failed: {0}")]
    Preflight(#[from] PreflightError),

    #[error("step '{label}' failed: {source}")]
    StepFailed {
        label:  String,
        #[source]
        source: BoxError,
    },

    #[error("cancelled at step '{label}'")]
    Cancelled { label: String },

    #[error("prefix '{root}' is already being backed up or restored")]
    Busy { root: PathBuf },

    #[error("executable '{path}' does not match its recorded hash (expected {expected}, found {actual})")]
    ExecutableMismatch {
        path:     PathBuf,
        expected: String,
        actual:   String,
    },

    #[error("{context} '{path}': {source}")]
    Io {
        context: &'static str,
        path:    PathBuf,
        source:  io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Archive(#[from] cellar_archive::Error),

    #[error(transparent)]
    Fs(#[from] cellar_fs::Error),

    #[error(transparent)]
    Platform(#[from] cellar_platform::Error),

    #[error(transparent)]
    Worker(#[from] cellar_pipeline::Error),
}

impl Error {
    /// Label of the step that failed or was cancelled, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::StepFailed { label, .. } | Self::Cancelled { label } => Some(label),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool { matches!(self, Self::Cancelled { .. }) }

    /// The error a finished pipeline reports, `None` when it completed.
    pub(crate) fn from_outcome(outcome: Outcome) -> Option<Self> {
        match outcome {
            Outcome::Done => None,
            Outcome::Failed { label, error } => Some(Self::StepFailed { label, source: error }),
            Outcome::Cancelled { label } => Some(Self::Cancelled { label }),
        }
    }
}

/// Archive cancellation is a cancelled step, not a failed one.
pub(crate) fn archive_step_error(error: cellar_archive::Error) -> StepError {
    match error {
        cellar_archive::Error::Cancelled => StepError::Cancelled,
        other => StepError::from(other),
    }
}

/// Reasons an operation is refused before anything on disk changes.
#[derive(Debug, thiserror::Error)]
pub enum PreflightError {
    #[error("not enough free space: {available} bytes available, {required} bytes required")]
    InsufficientSpace { available: u64, required: u64 },

    #[error("'{path}' is not allowed to be bundled into a backup")]
    DisallowedSource { path: PathBuf },

    #[error("executable directory holds {bytes} bytes, above the {threshold} byte threshold; confirmation required")]
    ConfirmationRequired { bytes: u64, threshold: u64 },

    #[error("backups must be written as .tar.zst, got '{path}'")]
    UnsupportedDestination { path: PathBuf },

    #[error("no record for prefix '{id}'")]
    MissingRecord { id: String },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no record for prefix '{id}'")]
    NotFound { id: String },

    #[error("failed to read prefix record '{path}': {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("invalid prefix record '{path}': {source}")]
    Parse {
        path:   PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to encode prefix record for '{id}': {source}")]
    Encode {
        id:     String,
        source: serde_json::Error,
    },

    #[error("failed to write prefix record: {0}")]
    Write(#[from] cellar_fs::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("invalid config '{path}': {source}")]
    Parse {
        path:   PathBuf,
        source: toml::de::Error,
    },
}
