use cellar_pipeline::BoxError;

use crate::prefix::PrefixRecord;

/// Creates launchers/shortcuts for a restored prefix.
pub trait EntryPointRegistrar: Send + Sync {
    fn register(&self, record: &PrefixRecord) -> Result<(), BoxError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRegistrar;

impl EntryPointRegistrar for NoopRegistrar {
    fn register(&self, record: &PrefixRecord) -> Result<(), BoxError> {
        tracing::debug!(prefix = %record.id, "no entry points to register");
        Ok(())
    }
}
