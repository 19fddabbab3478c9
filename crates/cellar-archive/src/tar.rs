//! [`Archiver`] backed by a GNU tar subprocess.
//!
//! tar runs as the leader of its own process group together with the
//! compressor it spawns. Progress comes from `--checkpoint` lines echoed on
//! stderr; cancellation signals the whole group.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use cellar_platform::{Command, has_program};

use crate::listing::{parse_listing, top_level_component};
use crate::progress::{CHECKPOINT_MARKER, ProgressTracker, parse_checkpoint};
use crate::{ArchiveContext, ArchiveFormat, Archiver, CreateRequest, Error, Result};

#[derive(Debug, Clone)]
pub struct TarConfig {
    pub tar_program:        String,
    pub zstd_program:       String,
    /// `pigz` is substituted automatically when this is `gzip` and pigz is on PATH.
    pub gzip_program:       String,
    /// Records (10 KiB each) between two progress samples.
    pub checkpoint_records: u64,
    pub poll_interval:      Duration,
    /// How long a cancelled tar gets between SIGTERM and SIGKILL.
    pub terminate_grace:    Duration,
}

impl Default for TarConfig {
    fn default() -> Self {
        Self {
            tar_program:        "tar".to_string(),
            zstd_program:       "zstd".to_string(),
            gzip_program:       "gzip".to_string(),
            checkpoint_records: 100,
            poll_interval:      Duration::from_millis(100),
            terminate_grace:    Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TarArchiver {
    config: TarConfig,
}

impl TarArchiver {
    pub fn new(config: TarConfig) -> Self { Self { config } }

    pub fn config(&self) -> &TarConfig { &self.config }

    /// Compressor command line handed to tar's `--use-compress-program`.
    pub fn compressor(&self, format: ArchiveFormat) -> String {
        match format {
            ArchiveFormat::Current => format!("{} -T0", self.config.zstd_program),
            ArchiveFormat::Legacy => {
                if self.config.gzip_program == "gzip" && has_program("pigz") {
                    "pigz".to_string()
                } else {
                    self.config.gzip_program.clone()
                }
            }
        }
    }

    fn tar(&self, format: ArchiveFormat) -> Command {
        Command::new(self.config.tar_program.clone())
            .env("LC_ALL", "C")
            .arg(format!("--use-compress-program={}", self.compressor(format)))
    }

    fn with_checkpoints(&self, cmd: Command) -> Command {
        cmd.arg(format!("--checkpoint={}", self.config.checkpoint_records.max(1)))
            .arg(format!("--checkpoint-action=echo={CHECKPOINT_MARKER}%u"))
    }

    fn create_command(&self, request: &CreateRequest) -> Command {
        let mut cmd = self
            .with_checkpoints(self.tar(request.format))
            .arg("--create")
            .arg("--file")
            .arg(&request.output);
        for rule in &request.transforms {
            cmd = cmd.arg(format!("--transform={}", rule.to_tar_expression()));
        }
        for source in &request.sources {
            cmd = cmd.arg("-C").arg(&source.base).arg(&source.entry);
        }
        cmd
    }

    fn extract_command(&self, archive: &Path, format: ArchiveFormat, destination: &Path) -> Command {
        self.with_checkpoints(self.tar(format))
            .arg("--extract")
            .arg("--file")
            .arg(archive)
            .arg("-C")
            .arg(destination)
    }

    fn list_command(&self, archive: &Path, format: ArchiveFormat, verbose: bool) -> Command {
        let cmd = self.tar(format).arg("--list");
        let cmd = if verbose { cmd.arg("--verbose") } else { cmd };
        cmd.arg("--file").arg(archive)
    }

    /// Run `cmd` to completion, sampling progress and polling for
    /// cancellation. `output` is deleted on failure or cancellation.
    fn supervise(&self, cmd: Command, ctx: &ArchiveContext<'_>, output: Option<&Path>) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let tool = cmd.program().to_string();
        let mut child = spawn_group(cmd.stdout(Stdio::null()).stderr(Stdio::piped()))?;
        let Some(stderr) = child.stderr.take() else {
            terminate(&mut child, self.config.terminate_grace);
            return Err(Error::Supervise {
                tool,
                source: std::io::Error::other("stderr was not captured"),
            });
        };

        let (tx, rx) = mpsc::channel();
        let reader = match thread::Builder::new()
            .name("cellar-tar-stderr".to_string())
            .spawn(move || drain_stderr(stderr, &tx))
        {
            Ok(reader) => reader,
            Err(source) => {
                terminate(&mut child, self.config.terminate_grace);
                discard(output);
                return Err(Error::Supervise { tool, source });
            }
        };

        let mut tracker = ProgressTracker::new(ctx.expected(), self.config.checkpoint_records);
        let status: ExitStatus = loop {
            for checkpoint in rx.try_iter() {
                if let Some(fraction) = tracker.observe(checkpoint) {
                    ctx.report(fraction);
                }
            }

            if ctx.is_cancelled() {
                tracing::info!(tool = %tool, "cancelling archiver");
                terminate(&mut child, self.config.terminate_grace);
                let _ = reader.join();
                discard(output);
                return Err(Error::Cancelled);
            }

            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => thread::sleep(self.config.poll_interval),
                Err(source) => {
                    terminate(&mut child, self.config.terminate_grace);
                    let _ = reader.join();
                    discard(output);
                    return Err(Error::Supervise { tool, source });
                }
            }
        };

        let stderr = reader.join().unwrap_or_default();
        if !status.success() {
            discard(output);
            return Err(Error::ToolFailed {
                tool,
                code: status.code(),
                stderr: stderr.trim().to_string(),
            });
        }

        ctx.report(1.0);
        Ok(())
    }
}

impl Archiver for TarArchiver {
    fn create(&self, request: &CreateRequest, ctx: &ArchiveContext<'_>) -> Result<()> {
        if request.sources.is_empty() {
            return Err(Error::NoSources {
                output: request.output.clone(),
            });
        }
        tracing::info!(
            output = %request.output.display(),
            sources = request.sources.len(),
            transforms = request.transforms.len(),
            "creating archive"
        );
        self.supervise(self.create_command(request), ctx, Some(&request.output))
    }

    fn extract(&self, archive: &Path, destination: &Path, ctx: &ArchiveContext<'_>) -> Result<()> {
        let format = ArchiveFormat::detect(archive)?;
        std::fs::create_dir_all(destination).map_err(|source| Error::CreateDir {
            path: destination.to_path_buf(),
            source,
        })?;
        tracing::info!(
            archive = %archive.display(),
            destination = %destination.display(),
            ?format,
            "extracting archive"
        );
        self.supervise(self.extract_command(archive, format, destination), ctx, None)
    }

    fn uncompressed_size(&self, archive: &Path) -> Result<u64> {
        let format = ArchiveFormat::detect(archive)?;
        let mut cmd = self.list_command(archive, format, true);
        let tool = cmd.program().to_string();
        let output = cmd.output()?;
        if !output.status.success() {
            return Err(Error::ToolFailed {
                tool,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(parse_listing(&String::from_utf8_lossy(&output.stdout)))
    }

    fn top_level_entry(&self, archive: &Path) -> Result<String> {
        let format = ArchiveFormat::detect(archive)?;
        let cmd = self.list_command(archive, format, false);
        let tool = cmd.program().to_string();
        let mut child = spawn_group(cmd.stdout(Stdio::piped()).stderr(Stdio::piped()))?;

        let stderr = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut text = String::new();
                let _ = stderr.read_to_string(&mut text);
                text
            })
        });

        let mut first = String::new();
        let read = match child.stdout.take() {
            Some(stdout) => BufReader::new(stdout).read_line(&mut first),
            None => Ok(0),
        };

        if matches!(read, Ok(n) if n > 0) {
            // Only the first member is needed.
            terminate(&mut child, self.config.terminate_grace);
            return top_level_component(first.trim_end_matches(['\n', '\r']));
        }

        let status = child.wait().map_err(|source| Error::Supervise {
            tool: tool.clone(),
            source,
        })?;
        let stderr = stderr.and_then(|h| h.join().ok()).unwrap_or_default();
        if !status.success() {
            return Err(Error::ToolFailed {
                tool,
                code: status.code(),
                stderr: stderr.trim().to_string(),
            });
        }
        Err(Error::EmptyArchive {
            path: archive.to_path_buf(),
        })
    }
}

#[cfg(unix)]
fn spawn_group(cmd: Command) -> Result<Child> {
    Ok(cmd.stdin(Stdio::null()).new_process_group().spawn()?)
}

#[cfg(not(unix))]
fn spawn_group(cmd: Command) -> Result<Child> { Ok(cmd.stdin(Stdio::null()).spawn()?) }

/// Forward checkpoint numbers, return every other line.
fn drain_stderr(stderr: impl Read, checkpoints: &mpsc::Sender<u64>) -> String {
    let mut other = Vec::new();
    for line in BufReader::new(stderr).lines() {
        let Ok(line) = line else { break };
        match parse_checkpoint(&line) {
            Some(n) => {
                let _ = checkpoints.send(n);
            }
            None => other.push(line),
        }
    }
    other.join("\n")
}

/// SIGTERM the child's process group, escalate to SIGKILL after `grace`,
/// then reap the child.
fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Ok(raw) = i32::try_from(child.id()) {
            let group = Pid::from_raw(raw);
            if let Err(e) = killpg(group, Signal::SIGTERM) {
                tracing::debug!(pid = raw, error = %e, "failed to signal process group");
            }

            let deadline = Instant::now() + grace;
            while Instant::now() < deadline {
                match child.try_wait() {
                    Ok(Some(_)) => return,
                    Ok(None) => thread::sleep(Duration::from_millis(20)),
                    Err(_) => break,
                }
            }
            let _ = killpg(group, Signal::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    let _ = child.kill();
    let _ = child.wait();
}

fn discard(output: Option<&Path>) {
    let Some(output) = output else { return };
    match cellar_fs::remove_any(output) {
        Ok(()) => tracing::debug!(path = %output.display(), "removed partial archive"),
        Err(e) => tracing::warn!(path = %output.display(), error = %e, "failed to remove partial archive"),
    }
}

/// `true` when `program --version` identifies as GNU tar.
pub fn is_gnu_tar(program: &str) -> bool {
    Command::new(program)
        .arg("--version")
        .output()
        .map(|out| out.status.success() && String::from_utf8_lossy(&out.stdout).contains("GNU tar"))
        .unwrap_or(false)
}
