//! Prefix snapshot archives.
//!
//! # Architecture
//!
//! - `format.rs` - legacy/current format detection
//! - `transform.rs` - in-stream entry path rewriting
//! - `archiver.rs` - the [`Archiver`] seam and its request types
//! - `tar.rs` - GNU tar backend with progress and cancellation
//! - `listing.rs` - `tar --list` parsing
//! - `space.rs` - free-space gate for extraction

mod archiver;
mod error;
mod format;
pub mod listing;
pub mod progress;
mod space;
pub mod tar;
mod transform;

pub use archiver::{ArchiveContext, ArchiveSource, Archiver, CreateRequest};
pub use error::{Error, Result};
pub use format::ArchiveFormat;
pub use listing::{parse_listing, top_level_component};
pub use space::{SpaceCheck, has_enough_space};
pub use tar::{TarArchiver, TarConfig};
pub use transform::{TransformRule, apply_transforms};
