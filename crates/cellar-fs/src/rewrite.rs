//! Bulk literal find/replace of path fragments across a directory tree.
//!
//! Rules are applied one after another to the whole file content, so text
//! produced by an earlier rule is visible to later ones. Files that look
//! binary, are not valid UTF-8, or cannot be both read and written are
//! skipped and reported, never partially rewritten.

use std::borrow::Cow;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::{AtomicWriteOptions, Error, Result, atomic_write};

/// Number of leading bytes inspected for a NUL byte.
pub const SNIFF_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteRule {
    pub find:    String,
    pub replace: String,
}

impl RewriteRule {
    pub fn new(find: impl Into<String>, replace: impl Into<String>) -> Self {
        Self {
            find:    find.into(),
            replace: replace.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Binary,
    NotUtf8,
    PermissionDenied,
    Io(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skipped {
    pub path:   PathBuf,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Rewritten,
    Unchanged,
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Default)]
pub struct RewriteReport {
    pub scanned:   usize,
    pub rewritten: usize,
    pub skipped:   Vec<Skipped>,
}

/// Apply `rules` to `text` in order. Borrows when nothing matched.
pub fn apply_rules<'a>(text: &'a str, rules: &[RewriteRule]) -> Cow<'a, str> {
    let mut out = Cow::Borrowed(text);
    for rule in rules {
        if rule.find.is_empty() || !out.contains(rule.find.as_str()) {
            continue;
        }
        out = Cow::Owned(out.replace(rule.find.as_str(), &rule.replace));
    }
    out
}

/// Rewrite every regular file below `root`.
///
/// Symlinks are not followed, so links pointing outside the tree are left
/// alone. Only an unreadable `root` is an error; per-file problems end up in
/// [`RewriteReport::skipped`].
pub fn rewrite_tree(root: impl AsRef<Path>, rules: &[RewriteRule]) -> Result<RewriteReport> {
    let root = root.as_ref();
    if !root.is_dir() {
        return Err(Error::NotFound(root.to_path_buf()));
    }

    let mut report = RewriteReport::default();
    if rules.is_empty() {
        return Ok(report);
    }

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => {
                return Err(Error::Walk {
                    path:   root.to_path_buf(),
                    source: e,
                });
            }
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                tracing::debug!(path = %path.display(), error = %e, "skipping unreadable entry");
                report.skipped.push(Skipped {
                    path,
                    reason: SkipReason::Io(e.to_string()),
                });
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        report.scanned += 1;
        match rewrite_file(entry.path(), rules) {
            FileOutcome::Rewritten => report.rewritten += 1,
            FileOutcome::Unchanged => {}
            FileOutcome::Skipped(reason) => {
                tracing::debug!(path = %entry.path().display(), ?reason, "rewrite skipped");
                report.skipped.push(Skipped {
                    path: entry.path().to_path_buf(),
                    reason,
                });
            }
        }
    }

    tracing::debug!(
        root = %root.display(),
        scanned = report.scanned,
        rewritten = report.rewritten,
        skipped = report.skipped.len(),
        "rewrite finished"
    );
    Ok(report)
}

/// Rewrite a single file in place.
pub fn rewrite_file(path: &Path, rules: &[RewriteRule]) -> FileOutcome {
    if !can_read_write(path) {
        return FileOutcome::Skipped(SkipReason::PermissionDenied);
    }

    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) => return FileOutcome::Skipped(io_reason(e)),
    };

    let mut bytes = Vec::new();
    if let Err(e) = file.read_to_end(&mut bytes) {
        return FileOutcome::Skipped(io_reason(e));
    }
    drop(file);

    if looks_binary(&bytes) {
        return FileOutcome::Skipped(SkipReason::Binary);
    }

    let text = match std::str::from_utf8(&bytes) {
        Ok(text) => text,
        Err(_) => return FileOutcome::Skipped(SkipReason::NotUtf8),
    };

    let rewritten = match apply_rules(text, rules) {
        Cow::Borrowed(_) => return FileOutcome::Unchanged,
        Cow::Owned(s) => s,
    };

    let options = AtomicWriteOptions::new().preserve_from(path);
    match atomic_write(path, rewritten.as_bytes(), options) {
        Ok(()) => FileOutcome::Rewritten,
        Err(Error::Write { source, .. }) => FileOutcome::Skipped(io_reason(source)),
        Err(e) => FileOutcome::Skipped(SkipReason::Io(e.to_string())),
    }
}

/// A NUL byte in the first [`SNIFF_LEN`] bytes marks the content as binary.
pub fn looks_binary(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(SNIFF_LEN)];
    window.contains(&0)
}

fn io_reason(e: std::io::Error) -> SkipReason {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => SkipReason::PermissionDenied,
        _ => SkipReason::Io(e.to_string()),
    }
}

#[cfg(unix)]
fn can_read_write(path: &Path) -> bool {
    use nix::unistd::{AccessFlags, access};
    access(path, AccessFlags::R_OK | AccessFlags::W_OK).is_ok()
}

#[cfg(not(unix))]
fn can_read_write(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| !m.permissions().readonly())
        .unwrap_or(false)
}
