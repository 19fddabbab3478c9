//! Environment-specific per-user state inside a prefix.
//!
//! A prefix's user directory usually contains symlinks into the owner's real
//! home (Desktop, Documents, ...). They are meaningless on another machine
//! and would drag the home directory into an archive, so they are swapped
//! for empty directories before archiving and recreated afterwards.

use std::path::{Path, PathBuf};

use cellar_fs::{AtomicWriteOptions, atomic_write};
use cellar_pipeline::BoxError;
use serde::{Deserialize, Serialize};

use crate::config::CellarConfig;
use crate::context::RewriteContext;
use crate::prefix::metadata_dir;

/// Manifest of replaced links, relative to the prefix root.
pub const HOME_LINKS_FILE: &str = "home-links.json";

pub trait StateAdjuster: Send + Sync {
    /// Turn machine-specific state under `root` into a portable form.
    fn externalize(&self, root: &Path, ctx: &RewriteContext) -> Result<(), BoxError>;

    /// Rebuild machine-specific state under `root` for `ctx`.
    fn internalize(&self, root: &Path, ctx: &RewriteContext) -> Result<(), BoxError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopState;

impl StateAdjuster for NoopState {
    fn externalize(&self, _root: &Path, _ctx: &RewriteContext) -> Result<(), BoxError> { Ok(()) }

    fn internalize(&self, _root: &Path, _ctx: &RewriteContext) -> Result<(), BoxError> { Ok(()) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct HomeLink {
    /// Entry name inside the user directory.
    name:   String,
    /// Link target relative to the home directory.
    target: PathBuf,
}

#[derive(Debug, thiserror::Error)]
enum HomeLinksError {
    #[error("failed to inspect '{path}': {source}")]
    Inspect { path: PathBuf, source: std::io::Error },

    #[error("failed to replace '{path}': {source}")]
    Replace { path: PathBuf, source: std::io::Error },

    #[error("invalid manifest '{path}': {source}")]
    Manifest {
        path:   PathBuf,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Fs(#[from] cellar_fs::Error),
}

/// Replaces user-directory symlinks that point into the home directory.
#[derive(Debug, Clone)]
pub struct HomeLinks {
    users_dir: PathBuf,
}

impl HomeLinks {
    pub fn new(users_dir: impl Into<PathBuf>) -> Self {
        Self {
            users_dir: users_dir.into(),
        }
    }

    pub fn from_config(config: &CellarConfig) -> Self { Self::new(config.users_dir.clone()) }

    fn manifest_path(root: &Path) -> PathBuf { metadata_dir(root).join(HOME_LINKS_FILE) }

    /// The user directory: the real user's, or the placeholder one found in
    /// a freshly extracted archive.
    fn user_dir(&self, root: &Path, ctx: &RewriteContext) -> Option<PathBuf> {
        [&ctx.username, &ctx.user_token]
            .into_iter()
            .filter(|name| !name.is_empty())
            .map(|name| root.join(&self.users_dir).join(name))
            .find(|dir| dir.is_dir())
    }

    fn do_externalize(&self, root: &Path, ctx: &RewriteContext) -> Result<(), HomeLinksError> {
        let Some(user_dir) = self.user_dir(root, ctx) else {
            return Ok(());
        };

        let entries = std::fs::read_dir(&user_dir).map_err(|source| HomeLinksError::Inspect {
            path: user_dir.clone(),
            source,
        })?;

        let mut links = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| HomeLinksError::Inspect {
                path: user_dir.clone(),
                source,
            })?;
            let path = entry.path();
            let Ok(target) = std::fs::read_link(&path) else {
                continue;
            };
            let Ok(relative) = target.strip_prefix(&ctx.home) else {
                continue;
            };
            links.push((path, HomeLink {
                name:   entry.file_name().to_string_lossy().into_owned(),
                target: relative.to_path_buf(),
            }));
        }

        if links.is_empty() {
            return Ok(());
        }
        links.sort_by(|a, b| a.1.name.cmp(&b.1.name));

        // Manifest first, so a half-done pass can still be undone.
        let manifest: Vec<&HomeLink> = links.iter().map(|(_, link)| link).collect();
        self.write_manifest(root, &manifest)?;

        for (path, _) in &links {
            std::fs::remove_file(path)
                .and_then(|()| std::fs::create_dir(path))
                .map_err(|source| HomeLinksError::Replace {
                    path: path.clone(),
                    source,
                })?;
        }
        tracing::debug!(root = %root.display(), links = links.len(), "replaced home links");
        Ok(())
    }

    fn do_internalize(&self, root: &Path, ctx: &RewriteContext) -> Result<(), HomeLinksError> {
        let manifest_path = Self::manifest_path(root);
        let text = match std::fs::read_to_string(&manifest_path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(HomeLinksError::Inspect {
                    path: manifest_path,
                    source,
                });
            }
        };
        let links: Vec<HomeLink> =
            serde_json::from_str(&text).map_err(|source| HomeLinksError::Manifest {
                path: manifest_path.clone(),
                source,
            })?;

        if let Some(user_dir) = self.user_dir(root, ctx) {
            for link in &links {
                restore_link(&user_dir.join(&link.name), &ctx.home.join(&link.target))?;
            }
        }

        cellar_fs::remove_any(&manifest_path)?;
        tracing::debug!(root = %root.display(), links = links.len(), "recreated home links");
        Ok(())
    }

    fn write_manifest(&self, root: &Path, links: &[&HomeLink]) -> Result<(), HomeLinksError> {
        let path = Self::manifest_path(root);
        let dir = metadata_dir(root);
        std::fs::create_dir_all(&dir).map_err(|source| HomeLinksError::Replace { path: dir, source })?;
        let json = serde_json::to_vec_pretty(links).map_err(|source| HomeLinksError::Manifest {
            path: path.clone(),
            source,
        })?;
        atomic_write(&path, &json, AtomicWriteOptions::new())?;
        Ok(())
    }
}

/// Put a symlink back where an empty placeholder directory stands.
/// Anything else already at `path` is left alone.
fn restore_link(path: &Path, target: &Path) -> Result<(), HomeLinksError> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => return Ok(()),
        Ok(meta) if meta.is_dir() => {
            if std::fs::remove_dir(path).is_err() {
                tracing::warn!(path = %path.display(), "user directory not empty, keeping it instead of the home link");
                return Ok(());
            }
        }
        Ok(_) => {
            tracing::warn!(path = %path.display(), "unexpected file where a home link belongs");
            return Ok(());
        }
        Err(_) => {}
    }
    symlink(target, path).map_err(|source| HomeLinksError::Replace {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> { std::os::unix::fs::symlink(target, link) }

#[cfg(not(unix))]
fn symlink(_target: &Path, link: &Path) -> std::io::Result<()> { std::fs::create_dir_all(link) }

impl StateAdjuster for HomeLinks {
    fn externalize(&self, root: &Path, ctx: &RewriteContext) -> Result<(), BoxError> {
        Ok(self.do_externalize(root, ctx)?)
    }

    fn internalize(&self, root: &Path, ctx: &RewriteContext) -> Result<(), BoxError> {
        Ok(self.do_internalize(root, ctx)?)
    }
}
