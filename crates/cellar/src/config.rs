//! User configuration, read from `<config dir>/cellar/config.toml`.
//!
//! Every field is optional; missing fields take their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use cellar_archive::TarConfig;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CellarConfig {
    /// Placeholder written in place of the home directory.
    pub home_token:           String,
    /// Placeholder written in place of the login name.
    pub user_token:           String,
    /// Per-user directory root, relative to a prefix root.
    pub users_dir:            PathBuf,
    /// Entries of `users_dir` that belong to no particular user.
    pub shared_user_dirs:     Vec<String>,
    /// Where a bundled executable directory lives, relative to a prefix root.
    pub program_dir:          PathBuf,
    /// Directories that are never bundled as an executable directory. The
    /// home directory is always refused as well.
    pub do_not_bundle:        Vec<PathBuf>,
    pub size_threshold_bytes: u64,
    pub archive:              ArchiveConfig,
}

impl Default for CellarConfig {
    fn default() -> Self {
        Self {
            home_token:           "%CELLAR_HOME%".to_string(),
            user_token:           "%CELLAR_USER%".to_string(),
            users_dir:            PathBuf::from("drive_c/users"),
            shared_user_dirs:     vec!["Public".to_string()],
            program_dir:          PathBuf::from(".cellar/program"),
            do_not_bundle:        ["/", "/usr", "/usr/bin", "/bin", "/opt", "/tmp"]
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            size_threshold_bytes: 3 * 1024 * 1024 * 1024,
            archive:              ArchiveConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub tar_program:        String,
    pub zstd_program:       String,
    pub gzip_program:       String,
    pub checkpoint_records: u64,
    pub poll_interval_ms:   u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        let tar = TarConfig::default();
        Self {
            tar_program:        tar.tar_program,
            zstd_program:       tar.zstd_program,
            gzip_program:       tar.gzip_program,
            checkpoint_records: tar.checkpoint_records,
            poll_interval_ms:   100,
        }
    }
}

impl ArchiveConfig {
    pub fn tar_config(&self) -> TarConfig {
        TarConfig {
            tar_program: self.tar_program.clone(),
            zstd_program: self.zstd_program.clone(),
            gzip_program: self.gzip_program.clone(),
            checkpoint_records: self.checkpoint_records,
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            ..TarConfig::default()
        }
    }
}

impl CellarConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<string>"),
            source,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The user's config file when it exists, defaults otherwise.
    pub fn load_default() -> Result<Self, ConfigError> {
        match cellar_platform::dir::cellar_config_dir().map(|dir| dir.join(CONFIG_FILE)) {
            Some(path) if path.is_file() => {
                tracing::debug!(path = %path.display(), "loading config");
                Self::load(path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Whether `dir` may be bundled as an executable directory.
    pub fn may_bundle(&self, dir: &Path, home: &Path) -> bool {
        let dir = normalize(dir);
        if dir == normalize(home) {
            return false;
        }
        !self.do_not_bundle.iter().any(|denied| normalize(denied) == dir)
    }
}

fn normalize(path: &Path) -> PathBuf { path.canonicalize().unwrap_or_else(|_| path.components().collect()) }
