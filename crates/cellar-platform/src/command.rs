use crate::error::{Error, Result};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Child, Command as StdCommand, Output, Stdio};

/// Builder over [`std::process::Command`] that remembers the program name
/// for error reporting and renders the full command line for logs.
#[derive(Debug)]
pub struct Command {
    inner:   StdCommand,
    program: String,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        let program = program.into();
        Self {
            inner: StdCommand::new(&program),
            program,
        }
    }

    pub fn program(&self) -> &str { &self.program }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.inner.arg(arg);
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.inner.args(args);
        self
    }

    pub fn env<K, V>(mut self, key: K, val: V) -> Self
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.inner.env(key, val);
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.inner.current_dir(dir);
        self
    }

    pub fn stdin(mut self, cfg: Stdio) -> Self {
        self.inner.stdin(cfg);
        self
    }

    pub fn stdout(mut self, cfg: Stdio) -> Self {
        self.inner.stdout(cfg);
        self
    }

    pub fn stderr(mut self, cfg: Stdio) -> Self {
        self.inner.stderr(cfg);
        self
    }

    /// Start the child as the leader of a new process group, so the whole
    /// group (including pipeline stages it spawns) can be signalled at once.
    #[cfg(unix)]
    pub fn new_process_group(mut self) -> Self {
        use std::os::unix::process::CommandExt;
        self.inner.process_group(0);
        self
    }

    /// Program and arguments joined by spaces.
    pub fn display(&self) -> String {
        std::iter::once(self.inner.get_program())
            .chain(self.inner.get_args())
            .map(|s| s.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn output(&mut self) -> Result<Output> {
        tracing::debug!(cmd = %self.display(), "running command");
        self.inner.output().map_err(|e| self.failed(e))
    }

    pub fn spawn(&mut self) -> Result<Child> {
        tracing::debug!(cmd = %self.display(), "spawning command");
        self.inner.spawn().map_err(|e| self.failed(e))
    }

    fn failed(&self, source: std::io::Error) -> Error {
        if source.kind() == std::io::ErrorKind::NotFound {
            Error::CommandNotFound {
                cmd: self.program.clone(),
            }
        } else {
            Error::CommandFailed {
                cmd: self.program.clone(),
                source,
            }
        }
    }
}

/// Resolve `program` against `PATH`.
pub fn find_program(program: impl AsRef<OsStr>) -> Option<PathBuf> { which::which(program).ok() }

/// Whether `program` resolves on `PATH`.
pub fn has_program(program: impl AsRef<OsStr>) -> bool { find_program(program).is_some() }
