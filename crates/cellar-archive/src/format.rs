use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::{Error, Result};

/// The two archive layouts a prefix snapshot can come in.
///
/// `Current` is a zstd-compressed tar written by this crate. `Legacy` is a
/// gzip-compressed tar from older tooling, which lacks the prefix metadata
/// and user-state manifest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArchiveFormat {
    Legacy,
    Current,
}

impl ArchiveFormat {
    /// Canonical file extension, without the leading dot.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Legacy => "tar.gz",
            Self::Current => "tar.zst",
        }
    }

    /// Classify by file name alone.
    pub fn from_extension(path: impl AsRef<Path>) -> Option<Self> {
        let name = path.as_ref().file_name()?.to_string_lossy().to_ascii_lowercase();
        if name.ends_with(".tar.zst") || name.ends_with(".tzst") {
            Some(Self::Current)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::Legacy)
        } else {
            None
        }
    }

    /// Classify by the compressor's magic bytes.
    pub fn from_magic(header: &[u8]) -> Option<Self> {
        match header {
            [0x28, 0xB5, 0x2F, 0xFD, ..] => Some(Self::Current),
            [0x1F, 0x8B, ..] => Some(Self::Legacy),
            _ => None,
        }
    }

    /// Extension first, then magic bytes.
    pub fn detect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(format) = Self::from_extension(path) {
            return Ok(format);
        }

        let mut header = [0u8; 4];
        let read = File::open(path)
            .and_then(|mut f| read_prefix(&mut f, &mut header))
            .map_err(|source| Error::Read {
                path: path.to_path_buf(),
                source,
            })?;

        Self::from_magic(&header[..read]).ok_or_else(|| Error::UnsupportedFormat {
            path: path.to_path_buf(),
        })
    }
}

fn read_prefix(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
