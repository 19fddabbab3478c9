//! Prefix metadata persistence.

use std::path::{Path, PathBuf};

use cellar_fs::{AtomicWriteOptions, atomic_write};

use crate::error::StoreError;
use crate::prefix::{PrefixRecord, metadata_dir};

/// File name of the record inside a prefix's metadata directory.
pub const RECORD_FILE: &str = "prefix.json";

/// Narrow view of the prefix metadata store.
pub trait PrefixStore: Send + Sync {
    fn load(&self, id: &str) -> Result<PrefixRecord, StoreError>;

    fn set_executable_path(&self, id: &str, path: &Path) -> Result<(), StoreError>;

    /// Record the executable's content hash. Stores without integrity
    /// support may ignore it.
    fn set_executable_hash(&self, _id: &str, _hash: Option<&str>) -> Result<(), StoreError> { Ok(()) }
}

/// Keeps every record at `<prefixes_dir>/<id>/.cellar/prefix.json`, so a
/// record travels inside its prefix's archive.
#[derive(Debug, Clone)]
pub struct JsonPrefixStore {
    prefixes_dir: PathBuf,
}

impl JsonPrefixStore {
    pub fn new(prefixes_dir: impl Into<PathBuf>) -> Self {
        Self {
            prefixes_dir: prefixes_dir.into(),
        }
    }

    pub fn prefixes_dir(&self) -> &Path { &self.prefixes_dir }

    pub fn root_of(&self, id: &str) -> PathBuf { self.prefixes_dir.join(id) }

    pub fn record_path(root: &Path) -> PathBuf { metadata_dir(root).join(RECORD_FILE) }

    /// Write `record` below `<prefixes_dir>/<record.id>`.
    pub fn save(&self, record: &PrefixRecord) -> Result<(), StoreError> {
        let path = Self::record_path(&self.root_of(&record.id));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| cellar_fs::Error::write(parent, e))?;
        }
        let mut json = serde_json::to_vec_pretty(record).map_err(|source| StoreError::Encode {
            id: record.id.clone(),
            source,
        })?;
        json.push(b'\n');
        atomic_write(&path, &json, AtomicWriteOptions::new())?;
        Ok(())
    }

    fn update(&self, id: &str, change: impl FnOnce(&mut PrefixRecord)) -> Result<(), StoreError> {
        let mut record = self.load(id)?;
        change(&mut record);
        self.save(&record)
    }
}

impl PrefixStore for JsonPrefixStore {
    fn load(&self, id: &str) -> Result<PrefixRecord, StoreError> {
        let root = self.root_of(id);
        let path = Self::record_path(&root);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound { id: id.to_string() });
            }
            Err(source) => return Err(StoreError::Read { path, source }),
        };
        let mut record: PrefixRecord =
            serde_json::from_str(&text).map_err(|source| StoreError::Parse { path, source })?;
        record.id = id.to_string();
        record.root = root;
        Ok(record)
    }

    fn set_executable_path(&self, id: &str, path: &Path) -> Result<(), StoreError> {
        tracing::debug!(prefix = id, executable = %path.display(), "updating executable path");
        self.update(id, |record| record.executable = Some(path.to_path_buf()))
    }

    fn set_executable_hash(&self, id: &str, hash: Option<&str>) -> Result<(), StoreError> {
        self.update(id, |record| record.executable_hash = hash.map(str::to_string))
    }
}
