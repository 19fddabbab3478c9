//! Snapshotting a prefix into a portable archive.
//!
//! The live prefix is made portable in place (steps 1-3), archived (step 4)
//! and then put back exactly as it was (steps 5-7). Every in-place change is
//! journaled when applied, so a failure or cancellation anywhere can undo all
//! of them, not only the ones a later step would have reverted.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cellar_archive::{ArchiveContext, ArchiveFormat, Archiver, CreateRequest, TransformRule};
use cellar_fs::{directory_size, remove_any, rewrite_tree, sha256_file};
use cellar_pipeline::{
    BoxError, CancellationToken, Pipeline, PipelineHandle, PipelineObserver, Step, StepError,
};

use crate::config::CellarConfig;
use crate::context::RewriteContext;
use crate::error::{PreflightError, StoreError, archive_step_error};
use crate::lock::PrefixLocks;
use crate::prefix::PrefixRecord;
use crate::state::StateAdjuster;
use crate::store::PrefixStore;
use crate::{Error, Result};

pub const STEP_EXTERNALIZE_PATHS: &str = "Externalizing paths";
pub const STEP_REVERT_STATE: &str = "Reverting user state";
pub const STEP_UPDATE_EXECUTABLE: &str = "Updating executable path";
pub const STEP_CREATE_ARCHIVE: &str = "Creating archive";
pub const STEP_RESTORE_STATE: &str = "Restoring user state";
pub const STEP_INTERNALIZE_PATHS: &str = "Internalizing paths";
pub const STEP_RESTORE_EXECUTABLE: &str = "Restoring executable path";

#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub prefix_id:     String,
    /// Must end in `.tar.zst`.
    pub destination:   PathBuf,
    pub context:       RewriteContext,
    /// Bundle an executable directory above the size threshold anyway.
    pub confirm_large: bool,
}

impl BackupRequest {
    pub fn new(prefix_id: impl Into<String>, destination: impl Into<PathBuf>, context: RewriteContext) -> Self {
        Self {
            prefix_id: prefix_id.into(),
            destination: destination.into(),
            context,
            confirm_large: false,
        }
    }

    pub fn confirm_large(mut self, confirm: bool) -> Self {
        self.confirm_large = confirm;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSummary {
    pub archive:       PathBuf,
    pub archive_bytes: u64,
    pub prefix_bytes:  u64,
    pub bundled_bytes: u64,
}

/// Builds and runs backup pipelines.
#[derive(Clone)]
pub struct BackupOrchestrator {
    config:   Arc<CellarConfig>,
    store:    Arc<dyn PrefixStore>,
    state:    Arc<dyn StateAdjuster>,
    archiver: Arc<dyn Archiver>,
    locks:    PrefixLocks,
}

impl BackupOrchestrator {
    pub fn new(
        config: CellarConfig,
        store: Arc<dyn PrefixStore>,
        state: Arc<dyn StateAdjuster>,
        archiver: Arc<dyn Archiver>,
        locks: PrefixLocks,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            state,
            archiver,
            locks,
        }
    }

    /// Whether bundling `bytes` needs explicit confirmation.
    pub fn would_exceed_size_threshold(&self, bytes: u64) -> bool { bytes > self.config.size_threshold_bytes }

    /// Start a backup on a dedicated worker.
    ///
    /// A missing record or a prefix already owned by another pipeline is
    /// reported here; everything else comes back through the handle.
    pub fn run(
        &self,
        request: BackupRequest,
        observer: Arc<dyn PipelineObserver>,
    ) -> Result<PipelineHandle<Result<BackupSummary>>> {
        let record = self.store.load(&request.prefix_id).map_err(|e| match e {
            StoreError::NotFound { id } => Error::Preflight(PreflightError::MissingRecord { id }),
            other => Error::Store(other),
        })?;
        let lease = self.locks.acquire(&record.root)?;

        let mut request = request;
        request.context = request.context.with_config_tokens(&self.config);
        let job = BackupJob {
            orchestrator: self.clone(),
            record,
            request,
        };
        let name = format!("cellar-backup-{}", job.record.id);
        let handle = PipelineHandle::spawn(name, move |token| {
            let _lease = lease;
            job.execute(observer.as_ref(), &token)
        })?;
        Ok(handle)
    }
}

/// Where the executable ends up and what has to travel with it.
#[derive(Debug, Clone)]
struct ExecutablePlan {
    /// Path as stored in the record before the backup.
    original:      PathBuf,
    original_hash: Option<String>,
    /// Live file; hashed once step 1 has rewritten it, so the hash matches
    /// the archived bytes.
    absolute:      PathBuf,
    /// Prefix-relative path recorded for the duration of the archive step.
    archived:      PathBuf,
    /// Directory bundled under `program_dir`, when it lives outside the
    /// prefix.
    bundle_dir:    Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct BackupPlan {
    executable:    Option<ExecutablePlan>,
    prefix_bytes:  u64,
    bundled_bytes: u64,
}

/// An in-place change to the live prefix that still has to be undone.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Mutation {
    PathsExternalized,
    StateExternalized,
    ExecutableRepointed {
        original:      PathBuf,
        original_hash: Option<String>,
    },
    /// The archiver was started and may have written to the destination.
    ArchiveStarted,
}

impl Mutation {
    fn is_executable(&self) -> bool { matches!(self, Self::ExecutableRepointed { .. }) }
}

#[derive(Debug, Clone, Default)]
struct Journal {
    entries: Arc<Mutex<Vec<Mutation>>>,
}

impl Journal {
    fn entries(&self) -> MutexGuard<'_, Vec<Mutation>> { self.entries.lock().unwrap_or_else(PoisonError::into_inner) }

    fn record(&self, mutation: Mutation) { self.entries().push(mutation); }

    fn find(&self, matches: impl Fn(&Mutation) -> bool) -> Option<Mutation> {
        self.entries().iter().find(|m| matches(m)).cloned()
    }

    fn clear(&self, mutation: &Mutation) { self.entries().retain(|m| m != mutation); }

    /// Everything still pending, most recent first.
    fn drain(&self) -> Vec<Mutation> {
        let mut pending = std::mem::take(&mut *self.entries());
        pending.reverse();
        pending
    }
}

struct BackupJob {
    orchestrator: BackupOrchestrator,
    record:       PrefixRecord,
    request:      BackupRequest,
}

impl BackupJob {
    fn config(&self) -> &CellarConfig { &self.orchestrator.config }

    fn execute(self, observer: &dyn PipelineObserver, token: &CancellationToken) -> Result<BackupSummary> {
        let plan = self.preflight()?;
        tracing::info!(
            prefix = %self.record.id,
            destination = %self.request.destination.display(),
            prefix_bytes = plan.prefix_bytes,
            bundled_bytes = plan.bundled_bytes,
            "starting backup"
        );

        let journal = Journal::default();
        let undo = Undo::new(&self);
        let mut pipeline = Pipeline::new(self.steps(&plan, &journal, &undo));
        let outcome = pipeline.run(observer, token);

        if let Some(error) = Error::from_outcome(outcome) {
            self.compensate(&journal, &undo);
            return Err(error);
        }

        let archive_bytes = std::fs::metadata(&self.request.destination)
            .map(|m| m.len())
            .map_err(|source| Error::Io {
                context: "failed to inspect archive",
                path:    self.request.destination.clone(),
                source,
            })?;
        Ok(BackupSummary {
            archive: self.request.destination.clone(),
            archive_bytes,
            prefix_bytes: plan.prefix_bytes,
            bundled_bytes: plan.bundled_bytes,
        })
    }

    fn preflight(&self) -> Result<BackupPlan> {
        let destination = &self.request.destination;
        if ArchiveFormat::from_extension(destination) != Some(ArchiveFormat::Current) {
            return Err(PreflightError::UnsupportedDestination {
                path: destination.clone(),
            }
            .into());
        }

        let root = &self.record.root;
        let executable = self.plan_executable()?;
        let bundle_dir = executable.as_ref().and_then(|exe| exe.bundle_dir.as_deref());
        if let Some(dir) = bundle_dir {
            if !self.config().may_bundle(dir, &self.request.context.home) {
                return Err(PreflightError::DisallowedSource {
                    path: dir.to_path_buf(),
                }
                .into());
            }
        }

        let prefix_bytes = directory_size(root)?;
        let bundled_bytes = bundle_dir.map(directory_size).transpose()?.unwrap_or(0);

        if self.orchestrator.would_exceed_size_threshold(bundled_bytes) && !self.request.confirm_large {
            return Err(PreflightError::ConfirmationRequired {
                bytes:     bundled_bytes,
                threshold: self.config().size_threshold_bytes,
            }
            .into());
        }

        check_space(cellar_fs::available_space(root)?, prefix_bytes.saturating_add(bundled_bytes))?;

        Ok(BackupPlan {
            executable,
            prefix_bytes,
            bundled_bytes,
        })
    }

    fn plan_executable(&self) -> Result<Option<ExecutablePlan>> {
        let (Some(original), Some(absolute)) = (&self.record.executable, self.record.resolved_executable()) else {
            return Ok(None);
        };
        let root = &self.record.root;
        if !absolute.is_file() {
            return Err(cellar_fs::Error::NotFound(absolute).into());
        }

        let (archived, bundle_dir) = match absolute.strip_prefix(root) {
            Ok(relative) => (relative.to_path_buf(), None),
            Err(_) => {
                let dir = absolute
                    .parent()
                    .ok_or_else(|| cellar_fs::Error::NoParent(absolute.clone()))?;
                let file_name = absolute
                    .file_name()
                    .ok_or_else(|| cellar_fs::Error::NoFileName(absolute.clone()))?;
                (self.config().program_dir.join(file_name), Some(dir.to_path_buf()))
            }
        };

        Ok(Some(ExecutablePlan {
            original: original.clone(),
            original_hash: self.record.executable_hash.clone(),
            absolute,
            archived,
            bundle_dir,
        }))
    }

    fn steps(&self, plan: &BackupPlan, journal: &Journal, undo: &Undo) -> Vec<Step> {
        let root = self.record.root.clone();
        let ctx = self.request.context.clone();

        let externalize_paths = {
            let (root, journal) = (root.clone(), journal.clone());
            let rules = ctx.externalize_rules();
            Step::new(STEP_EXTERNALIZE_PATHS, move |_| {
                journal.record(Mutation::PathsExternalized);
                let report = rewrite_tree(&root, &rules)?;
                tracing::debug!(rewritten = report.rewritten, skipped = report.skipped.len(), "paths externalized");
                Ok(())
            })
        };

        let revert_state = {
            let (root, ctx, journal) = (root.clone(), ctx.clone(), journal.clone());
            let state = Arc::clone(&self.orchestrator.state);
            Step::new(STEP_REVERT_STATE, move |_| {
                journal.record(Mutation::StateExternalized);
                state.externalize(&root, &ctx).map_err(StepError::boxed)
            })
        };

        let update_executable = {
            let (journal, store) = (journal.clone(), Arc::clone(&self.orchestrator.store));
            let id = self.record.id.clone();
            let executable = plan.executable.clone();
            Step::new(STEP_UPDATE_EXECUTABLE, move |_| {
                let Some(exe) = executable else {
                    return Ok(());
                };
                let hash = sha256_file(&exe.absolute)?;
                store.set_executable_path(&id, &exe.archived)?;
                journal.record(Mutation::ExecutableRepointed {
                    original:      exe.original,
                    original_hash: exe.original_hash,
                });
                store.set_executable_hash(&id, Some(&hash))?;
                Ok(())
            })
        };

        let create_archive = {
            let journal = journal.clone();
            let archiver = Arc::clone(&self.orchestrator.archiver);
            let request = self.create_request(plan);
            let expected = plan.prefix_bytes.saturating_add(plan.bundled_bytes);
            Step::new(STEP_CREATE_ARCHIVE, move |step| {
                if let Some(parent) = request.output.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(|e| cellar_fs::Error::write(parent, e))?;
                }
                journal.record(Mutation::ArchiveStarted);
                let progress = |fraction: f64| step.report_progress(fraction);
                let actx = ArchiveContext::new(step.token())
                    .on_progress(&progress)
                    .expected_bytes(expected);
                archiver.create(&request, &actx).map_err(archive_step_error)
            })
        };

        vec![
            externalize_paths,
            revert_state,
            update_executable,
            create_archive,
            self.resolve_step(STEP_RESTORE_STATE, journal, undo, |m| *m == Mutation::StateExternalized),
            self.resolve_step(STEP_INTERNALIZE_PATHS, journal, undo, |m| *m == Mutation::PathsExternalized),
            self.resolve_step(STEP_RESTORE_EXECUTABLE, journal, undo, Mutation::is_executable),
        ]
    }

    /// A step that undoes the pending mutation selected by `matches` and
    /// clears it from the journal once undone.
    fn resolve_step(
        &self,
        label: &'static str,
        journal: &Journal,
        undo: &Undo,
        matches: fn(&Mutation) -> bool,
    ) -> Step {
        let (journal, undo) = (journal.clone(), undo.clone());
        Step::new(label, move |_| {
            if let Some(mutation) = journal.find(matches) {
                undo.apply(&mutation).map_err(StepError::boxed)?;
                journal.clear(&mutation);
            }
            Ok(())
        })
    }

    fn create_request(&self, plan: &BackupPlan) -> CreateRequest {
        let root = &self.record.root;
        let base = root.parent().unwrap_or_else(|| Path::new("/"));
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.record.id.clone());

        let mut request = CreateRequest::new(&self.request.destination, ArchiveFormat::Current).source(base, &name);

        let ctx = &self.request.context;
        if !ctx.username.is_empty() {
            let users = Path::new(&name).join(&self.config().users_dir);
            request = request.transform(TransformRule::new(
                users.join(&ctx.username).to_string_lossy(),
                users.join(&ctx.user_token).to_string_lossy(),
            ));
        }

        if let Some(dir) = plan.executable.as_ref().and_then(|exe| exe.bundle_dir.as_ref()) {
            let program = Path::new(&name).join(&self.config().program_dir);
            request = request
                .source(dir, ".")
                .transform(TransformRule::new(".", program.to_string_lossy()));
        }
        request
    }

    fn compensate(&self, journal: &Journal, undo: &Undo) {
        for mutation in journal.drain() {
            tracing::info!(?mutation, prefix = %self.record.id, "undoing");
            if let Err(e) = undo.apply(&mutation) {
                tracing::warn!(?mutation, prefix = %self.record.id, error = %e, "compensation failed");
            }
        }
    }
}

/// Reverses journaled mutations.
#[derive(Clone)]
struct Undo {
    root:    PathBuf,
    id:      String,
    ctx:     RewriteContext,
    archive: PathBuf,
    state:   Arc<dyn StateAdjuster>,
    store:   Arc<dyn PrefixStore>,
}

impl Undo {
    fn new(job: &BackupJob) -> Self {
        Self {
            root:    job.record.root.clone(),
            id:      job.record.id.clone(),
            ctx:     job.request.context.clone(),
            archive: job.request.destination.clone(),
            state:   Arc::clone(&job.orchestrator.state),
            store:   Arc::clone(&job.orchestrator.store),
        }
    }

    fn apply(&self, mutation: &Mutation) -> std::result::Result<(), BoxError> {
        match mutation {
            Mutation::PathsExternalized => {
                let report = rewrite_tree(&self.root, &self.ctx.internalize_rules())?;
                tracing::debug!(rewritten = report.rewritten, skipped = report.skipped.len(), "paths internalized");
            }
            Mutation::StateExternalized => self.state.internalize(&self.root, &self.ctx)?,
            Mutation::ExecutableRepointed {
                original,
                original_hash,
            } => {
                self.store.set_executable_path(&self.id, original)?;
                self.store.set_executable_hash(&self.id, original_hash.as_deref())?;
            }
            Mutation::ArchiveStarted => {
                remove_any(&self.archive)?;
                tracing::debug!(archive = %self.archive.display(), "archive discarded");
            }
        }
        Ok(())
    }
}

fn check_space(available: u64, required: u64) -> std::result::Result<(), PreflightError> {
    if required > available {
        return Err(PreflightError::InsufficientSpace { available, required });
    }
    Ok(())
}
