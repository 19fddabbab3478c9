//! Filesystem primitives for snapshotting and restoring prefixes.
//!
//! - `rewrite` - literal path-fragment rewriting across a tree
//! - `size` - directory sizing and free-space queries
//! - `guard` - rename-based rollback of a replaced directory
//! - `merge` - directory merging
//! - `primitives` - atomic write and directory rename

mod error;
mod guard;
mod hash;
mod merge;
pub mod primitives;
pub mod rewrite;
mod size;

pub use error::{Error, Result};
pub use guard::{RollbackGuard, remove_any};
pub use hash::sha256_file;
pub use merge::merge_dir;
pub use primitives::{AtomicWriteOptions, ReplaceDirOptions, atomic_read, atomic_write, replace_dir};
pub use rewrite::{RewriteReport, RewriteRule, SkipReason, Skipped, apply_rules, rewrite_tree};
pub use size::{available_space, directory_size};
