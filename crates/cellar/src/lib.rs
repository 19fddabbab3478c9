//! Portable snapshots of application prefixes.
//!
//! [`BackupOrchestrator`] turns a live prefix into a `.tar.zst` archive whose
//! contents no longer mention the owner's home directory or login name;
//! [`RestoreOrchestrator`] unpacks such an archive for the current user. Both
//! run as [`cellar_pipeline`] pipelines on a worker thread and leave the
//! prefix as they found it when they fail or are cancelled.

pub mod backup;
pub mod config;
mod context;
mod error;
mod lock;
mod prefix;
mod registrar;
pub mod restore;
pub mod state;
mod store;

pub use backup::{BackupOrchestrator, BackupRequest, BackupSummary};
pub use config::{ArchiveConfig, CellarConfig};
pub use context::RewriteContext;
pub use error::{ConfigError, Error, PreflightError, Result, StoreError};
pub use lock::{PrefixLease, PrefixLocks};
pub use prefix::{Arch, METADATA_DIR, PrefixRecord};
pub use registrar::{EntryPointRegistrar, NoopRegistrar};
pub use restore::{RestoreOrchestrator, RestoreRequest, RestoreSummary};
pub use state::{HomeLinks, NoopState, StateAdjuster};
pub use store::{JsonPrefixStore, PrefixStore, RECORD_FILE};

pub use cellar_archive::{ArchiveFormat, Archiver, TarArchiver};
pub use cellar_pipeline::{
    CancellationToken, ChannelObserver, NoopObserver, OutcomeSummary, PipelineEvent, PipelineHandle,
    PipelineObserver,
};
