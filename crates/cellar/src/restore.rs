//! Reconstituting a prefix from an archive.
//!
//! An existing prefix at the target is moved aside before anything is
//! extracted and only deleted once every step succeeded; otherwise the
//! extracted tree is removed and the original renamed back.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicU64, Ordering};

use cellar_archive::{ArchiveContext, ArchiveFormat, Archiver, has_enough_space};
use cellar_fs::{RollbackGuard, merge_dir, remove_any, rewrite_tree, sha256_file};
use cellar_pipeline::{CancellationToken, Pipeline, PipelineHandle, PipelineObserver, Step, StepError};

use crate::config::CellarConfig;
use crate::context::RewriteContext;
use crate::error::{PreflightError, StoreError, archive_step_error};
use crate::lock::PrefixLocks;
use crate::prefix::PrefixRecord;
use crate::registrar::EntryPointRegistrar;
use crate::state::StateAdjuster;
use crate::store::PrefixStore;
use crate::{Error, Result};

pub const STEP_CHECK_SPACE: &str = "Checking disk space";
pub const STEP_EXTRACT: &str = "Extracting archive";
pub const STEP_RESTORE_STATE: &str = "Restoring user state";
pub const STEP_INTERNALIZE_PATHS: &str = "Internalizing paths";
pub const STEP_MERGE_USERS: &str = "Merging user directories";
pub const STEP_RELOCATE_EXECUTABLE: &str = "Relocating executable";
pub const STEP_REGISTER: &str = "Registering entry points";

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub archive:     PathBuf,
    /// Directory the prefix is restored into; the prefix itself lands in
    /// `<target_root>/<top-level entry>`. Should match the store's
    /// prefixes directory so the restored record can be found.
    pub target_root: PathBuf,
    pub context:     RewriteContext,
}

impl RestoreRequest {
    pub fn new(archive: impl Into<PathBuf>, target_root: impl Into<PathBuf>, context: RewriteContext) -> Self {
        Self {
            archive: archive.into(),
            target_root: target_root.into(),
            context,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreSummary {
    pub prefix_id: String,
    pub root:      PathBuf,
    pub format:    ArchiveFormat,
}

/// Builds and runs restore pipelines.
#[derive(Clone)]
pub struct RestoreOrchestrator {
    config:    Arc<CellarConfig>,
    store:     Arc<dyn PrefixStore>,
    state:     Arc<dyn StateAdjuster>,
    registrar: Arc<dyn EntryPointRegistrar>,
    archiver:  Arc<dyn Archiver>,
    locks:     PrefixLocks,
}

impl RestoreOrchestrator {
    pub fn new(
        config: CellarConfig,
        store: Arc<dyn PrefixStore>,
        state: Arc<dyn StateAdjuster>,
        registrar: Arc<dyn EntryPointRegistrar>,
        archiver: Arc<dyn Archiver>,
        locks: PrefixLocks,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            state,
            registrar,
            archiver,
            locks,
        }
    }

    /// Step labels run for an archive of `format`, in order.
    pub fn step_labels(format: ArchiveFormat) -> &'static [&'static str] {
        match format {
            ArchiveFormat::Current => &[
                STEP_CHECK_SPACE,
                STEP_EXTRACT,
                STEP_RESTORE_STATE,
                STEP_INTERNALIZE_PATHS,
                STEP_MERGE_USERS,
                STEP_RELOCATE_EXECUTABLE,
                STEP_REGISTER,
            ],
            ArchiveFormat::Legacy => &[
                STEP_CHECK_SPACE,
                STEP_EXTRACT,
                STEP_INTERNALIZE_PATHS,
                STEP_MERGE_USERS,
                STEP_REGISTER,
            ],
        }
    }

    /// Start a restore on a dedicated worker.
    ///
    /// The archive is classified and its prefix name read before the worker
    /// starts, so an unreadable archive or a busy target fails here.
    pub fn run(
        &self,
        request: RestoreRequest,
        observer: Arc<dyn PipelineObserver>,
    ) -> Result<PipelineHandle<Result<RestoreSummary>>> {
        let format = ArchiveFormat::detect(&request.archive)?;
        let name = self.archiver.top_level_entry(&request.archive)?;
        let root = request.target_root.join(&name);
        let lease = self.locks.acquire(&root)?;

        let mut request = request;
        request.context = request.context.with_config_tokens(&self.config);
        let job = RestoreJob {
            orchestrator: self.clone(),
            format,
            name,
            root,
            request,
        };
        let thread = format!("cellar-restore-{}", job.name);
        let handle = PipelineHandle::spawn(thread, move |token| {
            let _lease = lease;
            job.execute(observer.as_ref(), &token)
        })?;
        Ok(handle)
    }
}

struct RestoreJob {
    orchestrator: RestoreOrchestrator,
    format:       ArchiveFormat,
    name:         String,
    root:         PathBuf,
    request:      RestoreRequest,
}

impl RestoreJob {
    fn execute(self, observer: &dyn PipelineObserver, token: &CancellationToken) -> Result<RestoreSummary> {
        tracing::info!(
            archive = %self.request.archive.display(),
            root = %self.root.display(),
            format = ?self.format,
            "starting restore"
        );

        let guard = RollbackGuard::move_aside(&self.root)?;
        let mut pipeline = Pipeline::new(self.steps());
        let outcome = pipeline.run(observer, token);

        match Error::from_outcome(outcome) {
            None => {
                if let Some(guard) = guard {
                    if let Err(e) = guard.commit() {
                        tracing::warn!(root = %self.root.display(), error = %e, "failed to delete previous prefix");
                    }
                }
                Ok(RestoreSummary {
                    prefix_id: self.name,
                    root:      self.root,
                    format:    self.format,
                })
            }
            Some(error) => {
                self.roll_back(guard);
                Err(error)
            }
        }
    }

    fn roll_back(&self, guard: Option<RollbackGuard>) {
        if let Err(e) = remove_any(&self.root) {
            tracing::warn!(root = %self.root.display(), error = %e, "failed to remove partial restore");
        }
        if let Some(guard) = guard {
            if let Err(e) = guard.restore() {
                tracing::warn!(root = %self.root.display(), error = %e, "failed to put previous prefix back");
            }
        }
    }

    fn steps(&self) -> Vec<Step> {
        let required = Arc::new(AtomicU64::new(0));
        match self.format {
            ArchiveFormat::Current => {
                let digest = Arc::new(OnceLock::new());
                vec![
                    self.check_space(&required),
                    self.extract(&required, Some(&digest)),
                    self.restore_state(),
                    self.internalize_paths(),
                    self.merge_users(),
                    self.relocate_executable(&digest),
                    self.register(),
                ]
            }
            ArchiveFormat::Legacy => vec![
                self.check_space(&required),
                self.extract(&required, None),
                self.internalize_paths(),
                self.merge_users(),
                self.register(),
            ],
        }
    }

    fn check_space(&self, required: &Arc<AtomicU64>) -> Step {
        let archiver = Arc::clone(&self.orchestrator.archiver);
        let archive = self.request.archive.clone();
        let target = self.request.target_root.clone();
        let required = Arc::clone(required);
        Step::new(STEP_CHECK_SPACE, move |_| {
            let check = has_enough_space(archiver.as_ref(), &target, &archive);
            if !check.enough {
                return Err(PreflightError::InsufficientSpace {
                    available: check.available,
                    required:  check.required,
                }
                .into());
            }
            required.store(check.required, Ordering::Relaxed);
            Ok(())
        })
    }

    /// Extracts the archive. With `digest`, also hashes the recorded
    /// executable while it still holds placeholders.
    fn extract(&self, required: &Arc<AtomicU64>, digest: Option<&Arc<OnceLock<String>>>) -> Step {
        let archiver = Arc::clone(&self.orchestrator.archiver);
        let store = Arc::clone(&self.orchestrator.store);
        let archive = self.request.archive.clone();
        let target = self.request.target_root.clone();
        let (id, root) = (self.name.clone(), self.root.clone());
        let required = Arc::clone(required);
        let digest = digest.cloned();
        Step::new(STEP_EXTRACT, move |step| {
            std::fs::create_dir_all(&target).map_err(|e| cellar_fs::Error::write(&target, e))?;
            let progress = |fraction: f64| step.report_progress(fraction);
            let mut actx = ArchiveContext::new(step.token()).on_progress(&progress);
            let expected = required.load(Ordering::Relaxed);
            if expected > 0 {
                actx = actx.expected_bytes(expected);
            }
            archiver.extract(&archive, &target, &actx).map_err(archive_step_error)?;

            if let Some(digest) = digest {
                if let Some(hash) = archived_digest(store.as_ref(), &id, &root)? {
                    let _ = digest.set(hash);
                }
            }
            Ok(())
        })
    }

    fn restore_state(&self) -> Step {
        let state = Arc::clone(&self.orchestrator.state);
        let (root, ctx) = (self.root.clone(), self.request.context.clone());
        Step::new(STEP_RESTORE_STATE, move |_| state.internalize(&root, &ctx).map_err(StepError::boxed))
    }

    fn internalize_paths(&self) -> Step {
        let root = self.root.clone();
        let rules = self.request.context.internalize_rules();
        Step::new(STEP_INTERNALIZE_PATHS, move |_| {
            let report = rewrite_tree(&root, &rules)?;
            tracing::debug!(rewritten = report.rewritten, skipped = report.skipped.len(), "paths internalized");
            Ok(())
        })
    }

    fn merge_users(&self) -> Step {
        let users = self.root.join(&self.orchestrator.config.users_dir);
        let username = self.request.context.username.clone();
        let shared = self.orchestrator.config.shared_user_dirs.clone();
        Step::new(STEP_MERGE_USERS, move |_| {
            merge_user_dirs(&users, &username, &shared)?;
            Ok(())
        })
    }

    /// Makes the executable path absolute. A recorded hash is checked against
    /// the bytes as extracted, then refreshed for the rewritten file.
    fn relocate_executable(&self, digest: &Arc<OnceLock<String>>) -> Step {
        let store = Arc::clone(&self.orchestrator.store);
        let (id, root) = (self.name.clone(), self.root.clone());
        let digest = Arc::clone(digest);
        Step::new(STEP_RELOCATE_EXECUTABLE, move |_| {
            let record = match store.load(&id) {
                Ok(record) => record,
                Err(StoreError::NotFound { .. }) => {
                    tracing::debug!(prefix = %id, "no record in archive, nothing to relocate");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            let Some(executable) = record.executable.as_ref().filter(|exe| exe.is_relative()) else {
                return Ok(());
            };

            let absolute = root.join(executable);
            if let Some(expected) = &record.executable_hash {
                let archived = match digest.get() {
                    Some(hash) => hash.clone(),
                    None => sha256_file(&absolute)?,
                };
                verify_executable(&absolute, expected, archived)?;
                store.set_executable_hash(&id, Some(&sha256_file(&absolute)?))?;
            }
            store.set_executable_path(&id, &absolute)?;
            tracing::debug!(prefix = %id, executable = %absolute.display(), "executable relocated");
            Ok(())
        })
    }

    fn register(&self) -> Step {
        let store = Arc::clone(&self.orchestrator.store);
        let registrar = Arc::clone(&self.orchestrator.registrar);
        let (id, root) = (self.name.clone(), self.root.clone());
        Step::new(STEP_REGISTER, move |_| {
            let record = match store.load(&id) {
                Ok(record) => record,
                Err(StoreError::NotFound { .. }) => PrefixRecord::new(id, root),
                Err(e) => return Err(e.into()),
            };
            registrar.register(&record).map_err(StepError::boxed)
        })
    }
}

/// Fold every per-user directory that belongs to no known user into
/// `users/<username>`.
fn merge_user_dirs(users: &Path, username: &str, shared: &[String]) -> cellar_fs::Result<()> {
    if username.is_empty() || !users.is_dir() {
        return Ok(());
    }

    let mut strays = Vec::new();
    for entry in std::fs::read_dir(users).map_err(|e| cellar_fs::Error::read(users, e))? {
        let entry = entry.map_err(|e| cellar_fs::Error::read(users, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if is_dir && name != username && !shared.contains(&name) {
            strays.push(entry.path());
        }
    }
    strays.sort();

    let target = users.join(username);
    for stray in strays {
        tracing::debug!(from = %stray.display(), to = %target.display(), "merging user directory");
        merge_dir(&stray, &target)?;
    }
    Ok(())
}

/// Hash of the record's prefix-relative executable, when the record
/// carries one to check against.
fn archived_digest(store: &dyn PrefixStore, id: &str, root: &Path) -> Result<Option<String>> {
    let record = match store.load(id) {
        Ok(record) => record,
        Err(StoreError::NotFound { .. }) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if record.executable_hash.is_none() {
        return Ok(None);
    }
    match record.executable.filter(|exe| exe.is_relative()) {
        Some(exe) => Ok(Some(sha256_file(root.join(exe))?)),
        None => Ok(None),
    }
}

fn verify_executable(path: &Path, expected: &str, actual: String) -> Result<()> {
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(Error::ExecutableMismatch {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}
