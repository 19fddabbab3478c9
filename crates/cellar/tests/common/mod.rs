//! Shared fixtures: an in-process archiver built on the `tar` crate, a
//! sample prefix and tree snapshots.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

use cellar::{
    Archiver, BackupOrchestrator, CellarConfig, EntryPointRegistrar, HomeLinks, JsonPrefixStore,
    PipelineObserver, PrefixLocks, PrefixRecord, RestoreOrchestrator, RewriteContext, StateAdjuster,
};
use cellar_archive::{ArchiveContext, CreateRequest, Error, Result, apply_transforms, top_level_component};
use cellar_pipeline::{BoxError, CancellationToken};
use tempfile::TempDir;
use walkdir::WalkDir;

/// Writes and reads plain tar streams regardless of the file extension.
#[derive(Debug, Default)]
pub struct FakeArchiver {
    pub fail_create:   AtomicBool,
    /// Block inside `create` until cancelled.
    pub hang_create:   AtomicBool,
    /// Unpack, then block inside `extract` until cancelled.
    pub hang_extract:  AtomicBool,
    pub reported_size: Mutex<Option<u64>>,
}

impl FakeArchiver {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    fn wait_for_cancel(ctx: &ArchiveContext<'_>) {
        while !ctx.is_cancelled() {
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> Error + '_ {
    move |source| Error::Read {
        path: path.to_path_buf(),
        source,
    }
}

impl Archiver for FakeArchiver {
    fn create(&self, request: &CreateRequest, ctx: &ArchiveContext<'_>) -> Result<()> {
        let output = &request.output;
        let file = File::create(output).map_err(io_error(output))?;
        let mut builder = tar::Builder::new(file);
        builder.follow_symlinks(false);

        for source in &request.sources {
            let top = source.base.join(&source.entry);
            for entry in WalkDir::new(&top).follow_links(false).sort_by_file_name() {
                let entry = entry.map_err(|e| Error::Read {
                    path:   top.clone(),
                    source: e.into(),
                })?;
                let relative = entry.path().strip_prefix(&top).map_err(|_| Error::InvalidEntry {
                    entry: entry.path().display().to_string(),
                })?;
                let name = if relative.as_os_str().is_empty() {
                    source.entry.clone()
                } else {
                    format!("{}/{}", source.entry, relative.display())
                };
                let name = apply_transforms(&request.transforms, &name);
                builder
                    .append_path_with_name(entry.path(), &name)
                    .map_err(io_error(entry.path()))?;
            }
        }
        builder.into_inner().map_err(io_error(output))?;

        if self.fail_create.load(Ordering::SeqCst) {
            let _ = fs::remove_file(output);
            return Err(Error::ToolFailed {
                tool:   "tar".into(),
                code:   Some(2),
                stderr: "injected failure".into(),
            });
        }
        if self.hang_create.load(Ordering::SeqCst) {
            Self::wait_for_cancel(ctx);
            let _ = fs::remove_file(output);
            return Err(Error::Cancelled);
        }
        ctx.report(1.0);
        Ok(())
    }

    fn extract(&self, archive: &Path, destination: &Path, ctx: &ArchiveContext<'_>) -> Result<()> {
        let file = File::open(archive).map_err(io_error(archive))?;
        let mut tar = tar::Archive::new(file);
        tar.set_preserve_permissions(true);
        tar.unpack(destination).map_err(io_error(destination))?;

        if self.hang_extract.load(Ordering::SeqCst) {
            Self::wait_for_cancel(ctx);
            return Err(Error::Cancelled);
        }
        ctx.report(1.0);
        Ok(())
    }

    fn uncompressed_size(&self, archive: &Path) -> Result<u64> {
        if let Some(size) = *self.reported_size.lock().unwrap() {
            return Ok(size);
        }
        let file = File::open(archive).map_err(io_error(archive))?;
        let mut tar = tar::Archive::new(file);
        let mut total = 0;
        for entry in tar.entries().map_err(io_error(archive))? {
            let entry = entry.map_err(io_error(archive))?;
            if entry.header().entry_type().is_file() {
                total += entry.header().size().map_err(io_error(archive))?;
            }
        }
        Ok(total)
    }

    fn top_level_entry(&self, archive: &Path) -> Result<String> {
        let file = File::open(archive).map_err(io_error(archive))?;
        let mut tar = tar::Archive::new(file);
        let mut entries = tar.entries().map_err(io_error(archive))?;
        let first = entries
            .next()
            .ok_or_else(|| Error::EmptyArchive {
                path: archive.to_path_buf(),
            })?
            .map_err(io_error(archive))?;
        let path = first.path().map_err(io_error(archive))?;
        top_level_component(&path.to_string_lossy())
    }
}

/// Fails `externalize` or `internalize` on request, otherwise defers to
/// [`HomeLinks`].
pub struct FlakyState {
    pub inner:            HomeLinks,
    pub fail_externalize: AtomicBool,
    pub fail_internalize: AtomicBool,
}

impl FlakyState {
    pub fn new(config: &CellarConfig) -> Arc<Self> {
        Arc::new(Self {
            inner:            HomeLinks::from_config(config),
            fail_externalize: AtomicBool::new(false),
            fail_internalize: AtomicBool::new(false),
        })
    }
}

impl StateAdjuster for FlakyState {
    fn externalize(&self, root: &Path, ctx: &RewriteContext) -> std::result::Result<(), BoxError> {
        if self.fail_externalize.load(Ordering::SeqCst) {
            return Err("injected externalize failure".into());
        }
        self.inner.externalize(root, ctx)
    }

    fn internalize(&self, root: &Path, ctx: &RewriteContext) -> std::result::Result<(), BoxError> {
        if self.fail_internalize.load(Ordering::SeqCst) {
            return Err("injected internalize failure".into());
        }
        self.inner.internalize(root, ctx)
    }
}

#[derive(Default)]
pub struct RecordingRegistrar {
    pub registered: Mutex<Vec<PrefixRecord>>,
}

impl EntryPointRegistrar for RecordingRegistrar {
    fn register(&self, record: &PrefixRecord) -> std::result::Result<(), BoxError> {
        self.registered.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// Cancels the pipeline once `label` has finished.
///
/// The pipeline's token only exists after `run` returns, so the first
/// `on_step_start` waits until the test hands it over.
pub struct CancelAfter {
    label: String,
    token: Mutex<Option<CancellationToken>>,
    ready: Mutex<mpsc::Receiver<CancellationToken>>,
}

impl CancelAfter {
    pub fn new(label: &str) -> (Arc<Self>, mpsc::Sender<CancellationToken>) {
        let (tx, rx) = mpsc::channel();
        let observer = Arc::new(Self {
            label: label.to_string(),
            token: Mutex::new(None),
            ready: Mutex::new(rx),
        });
        (observer, tx)
    }
}

impl PipelineObserver for CancelAfter {
    fn on_step_start(&self, _label: &str) {
        let mut token = self.token.lock().unwrap();
        if token.is_none() {
            *token = self.ready.lock().unwrap().recv().ok();
        }
    }

    fn on_step_done(&self, label: &str) {
        if label == self.label {
            if let Some(token) = self.token.lock().unwrap().as_ref() {
                token.cancel();
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    File(Vec<u8>),
    Dir,
    Link(PathBuf),
}

/// Every entry below `root`, keyed by relative path.
pub fn snapshot(root: &Path) -> BTreeMap<PathBuf, Node> {
    WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .into_iter()
        .map(|entry| {
            let entry = entry.unwrap();
            let relative = entry.path().strip_prefix(root).unwrap().to_path_buf();
            let kind = entry.file_type();
            let node = if kind.is_symlink() {
                Node::Link(fs::read_link(entry.path()).unwrap())
            } else if kind.is_dir() {
                Node::Dir
            } else {
                Node::File(fs::read(entry.path()).unwrap())
            };
            (relative, node)
        })
        .collect()
}

pub const PREFIX: &str = "game";
pub const USER: &str = "alice";

/// A prefix owned by `alice` plus an executable directory in her home.
pub struct Fixture {
    pub dir:      TempDir,
    pub home:     PathBuf,
    pub prefixes: PathBuf,
    pub root:     PathBuf,
    pub exe_dir:  PathBuf,
    pub exe:      PathBuf,
    pub config:   CellarConfig,
    pub store:    Arc<JsonPrefixStore>,
    pub locks:    PrefixLocks,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("home").join(USER);
        let prefixes = dir.path().join("prefixes");
        let root = prefixes.join(PREFIX);
        let exe_dir = home.join("Games/game");
        let exe = exe_dir.join("game.exe");

        fs::create_dir_all(home.join("Documents")).unwrap();
        fs::create_dir_all(exe_dir.join("data")).unwrap();
        fs::write(&exe, b"MZ\0\0game binary").unwrap();
        fs::write(exe_dir.join("data/level1.dat"), "level one").unwrap();

        let users = root.join("drive_c/users");
        fs::create_dir_all(users.join(USER).join("AppData")).unwrap();
        fs::create_dir_all(users.join("Public")).unwrap();
        fs::create_dir_all(root.join("drive_c/windows/system32")).unwrap();
        fs::write(
            root.join("system.reg"),
            format!("\"Desktop\"=\"{}/Desktop\"\nowner={USER}\n", home.display()),
        )
        .unwrap();
        fs::write(
            users.join(USER).join("AppData/config.ini"),
            format!("data={}/app/data\n", home.display()),
        )
        .unwrap();
        fs::write(users.join("Public/readme.txt"), "shared").unwrap();
        let mut dll = b"MZ\0\0".to_vec();
        dll.extend_from_slice(home.to_string_lossy().as_bytes());
        fs::write(root.join("drive_c/windows/system32/lib.dll"), dll).unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(home.join("Documents"), users.join(USER).join("Documents")).unwrap();

        let store = Arc::new(JsonPrefixStore::new(&prefixes));
        store
            .save(&PrefixRecord::new(PREFIX, &root).runner("wine").executable(&exe))
            .unwrap();

        Self {
            dir,
            home,
            prefixes,
            root,
            exe_dir,
            exe,
            config: CellarConfig::default(),
            store,
            locks: PrefixLocks::new(),
        }
    }

    pub fn context(&self) -> RewriteContext { RewriteContext::new(&self.home, USER) }

    pub fn path(&self, name: &str) -> PathBuf { self.dir.path().join(name) }

    pub fn backup(&self, state: Arc<dyn StateAdjuster>, archiver: Arc<dyn Archiver>) -> BackupOrchestrator {
        BackupOrchestrator::new(
            self.config.clone(),
            self.store.clone(),
            state,
            archiver,
            self.locks.clone(),
        )
    }

    /// A restore orchestrator whose store reads records below `target`.
    pub fn restore(
        &self,
        target: &Path,
        state: Arc<dyn StateAdjuster>,
        registrar: Arc<dyn EntryPointRegistrar>,
        archiver: Arc<dyn Archiver>,
    ) -> RestoreOrchestrator {
        RestoreOrchestrator::new(
            self.config.clone(),
            Arc::new(JsonPrefixStore::new(target)),
            state,
            registrar,
            archiver,
            self.locks.clone(),
        )
    }

    pub fn home_links(&self) -> Arc<HomeLinks> { Arc::new(HomeLinks::from_config(&self.config)) }
}
