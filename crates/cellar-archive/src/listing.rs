//! Parsing of `tar --list` output.

use crate::{Error, Result};

/// Sum the sizes of regular-file rows in a `tar --list --verbose` table.
///
/// A row looks like `-rw-r--r-- user/group 1234 2024-01-01 12:00 path`.
/// Rows for anything but regular files, and rows that do not parse, are
/// ignored.
pub fn parse_listing(text: &str) -> u64 {
    text.lines()
        .filter(|line| line.starts_with('-'))
        .filter_map(|line| line.split_whitespace().nth(2)?.parse::<u64>().ok())
        .fold(0u64, u64::saturating_add)
}

/// First path component of an archive member name.
///
/// Leading `./` is dropped. Absolute names, `..` and empty names are
/// rejected, since the result becomes a directory name on disk.
pub fn top_level_component(entry: &str) -> Result<String> {
    let invalid = || Error::InvalidEntry {
        entry: entry.to_string(),
    };
    if entry.starts_with('/') {
        return Err(invalid());
    }

    let first = entry
        .split('/')
        .find(|c| !c.is_empty() && *c != ".")
        .ok_or_else(invalid)?;

    if first == ".." || first.contains('\0') {
        return Err(invalid());
    }
    Ok(first.to_string())
}
