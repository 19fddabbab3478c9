use std::path::Path;

use crate::Archiver;

/// Outcome of comparing free space against an archive's unpacked size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceCheck {
    pub enough:    bool,
    pub available: u64,
    pub required:  u64,
}

impl SpaceCheck {
    pub fn evaluate(available: u64, required: u64) -> Self {
        Self {
            enough: required <= available,
            available,
            required,
        }
    }
}

/// Whether `destination`'s filesystem can hold `archive` unpacked.
///
/// Any measurement error yields `enough: false` with whatever figures were
/// obtained (zero otherwise).
pub fn has_enough_space(archiver: &dyn Archiver, destination: &Path, archive: &Path) -> SpaceCheck {
    let required = match archiver.uncompressed_size(archive) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(archive = %archive.display(), error = %e, "could not size archive");
            return SpaceCheck {
                enough:    false,
                available: cellar_fs::available_space(destination).unwrap_or(0),
                required:  0,
            };
        }
    };

    match cellar_fs::available_space(destination) {
        Ok(available) => SpaceCheck::evaluate(available, required),
        Err(e) => {
            tracing::warn!(destination = %destination.display(), error = %e, "could not query free space");
            SpaceCheck {
                enough: false,
                available: 0,
                required,
            }
        }
    }
}
