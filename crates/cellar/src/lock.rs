use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{Error, Result};

/// Prefix roots currently owned by a running backup or restore.
///
/// Clones share the same registry; hand one clone to every orchestrator
/// that must exclude the others.
#[derive(Debug, Clone, Default)]
pub struct PrefixLocks {
    held: Arc<Mutex<HashSet<PathBuf>>>,
}

impl PrefixLocks {
    pub fn new() -> Self { Self::default() }

    /// Take ownership of `root`, or fail with [`Error::Busy`].
    pub fn acquire(&self, root: &Path) -> Result<PrefixLease> {
        let key = lock_key(root);
        if !self.held().insert(key.clone()) {
            return Err(Error::Busy {
                root: root.to_path_buf(),
            });
        }
        tracing::debug!(root = %key.display(), "prefix lock acquired");
        Ok(PrefixLease {
            locks: self.clone(),
            key,
        })
    }

    pub fn is_locked(&self, root: &Path) -> bool { self.held().contains(&lock_key(root)) }

    fn held(&self) -> MutexGuard<'_, HashSet<PathBuf>> { self.held.lock().unwrap_or_else(PoisonError::into_inner) }
}

/// Ownership of one prefix root, released on drop.
#[derive(Debug)]
pub struct PrefixLease {
    locks: PrefixLocks,
    key:   PathBuf,
}

impl PrefixLease {
    pub fn root(&self) -> &Path { &self.key }
}

impl Drop for PrefixLease {
    fn drop(&mut self) {
        self.locks.held().remove(&self.key);
        tracing::debug!(root = %self.key.display(), "prefix lock released");
    }
}

/// Canonical form of `root`, resolving the parent when `root` itself does
/// not exist yet.
fn lock_key(root: &Path) -> PathBuf {
    if let Ok(canonical) = root.canonicalize() {
        return canonical;
    }
    match (root.parent().and_then(|p| p.canonicalize().ok()), root.file_name()) {
        (Some(parent), Some(name)) => parent.join(name),
        _ => root.components().collect(),
    }
}
