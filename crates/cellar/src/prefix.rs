use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Per-prefix metadata directory, relative to the prefix root.
pub const METADATA_DIR: &str = ".cellar";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Win32,
    #[default]
    Win64,
}

/// What the metadata store knows about one prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixRecord {
    pub id:              String,
    /// Filled in by the store on load; never persisted.
    #[serde(skip)]
    pub root:            PathBuf,
    #[serde(default)]
    pub arch:            Arch,
    #[serde(default)]
    pub runner:          String,
    /// Absolute, or relative to `root`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable:      Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env:             BTreeMap<String, String>,
    /// Lowercase hex SHA-256 of the executable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable_hash: Option<String>,
}

impl PrefixRecord {
    pub fn new(id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            id:              id.into(),
            root:            root.into(),
            arch:            Arch::default(),
            runner:          String::new(),
            executable:      None,
            env:             BTreeMap::new(),
            executable_hash: None,
        }
    }

    pub fn arch(mut self, arch: Arch) -> Self {
        self.arch = arch;
        self
    }

    pub fn runner(mut self, runner: impl Into<String>) -> Self {
        self.runner = runner.into();
        self
    }

    pub fn executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Executable path with a relative record resolved against `root`.
    pub fn resolved_executable(&self) -> Option<PathBuf> {
        self.executable.as_ref().map(|exe| {
            if exe.is_absolute() {
                exe.clone()
            } else {
                self.root.join(exe)
            }
        })
    }

    pub fn metadata_dir(&self) -> PathBuf { metadata_dir(&self.root) }
}

pub fn metadata_dir(root: &Path) -> PathBuf { root.join(METADATA_DIR) }
