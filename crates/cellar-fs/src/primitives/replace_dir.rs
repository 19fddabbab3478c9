use crate::{Error, Result};
use std::path::Path;
use std::time::Duration;

#[derive(Clone, Copy, Debug)]
pub struct ReplaceDirOptions {
    pub retry_count: u32,
    pub retry_delay: Duration,
}

impl Default for ReplaceDirOptions {
    fn default() -> Self {
        Self {
            retry_count: 5,
            retry_delay: Duration::from_millis(100),
        }
    }
}

impl ReplaceDirOptions {
    pub fn new() -> Self { Self::default() }

    pub fn retry_count(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

/// Move the directory `src` to `dest` with a single rename.
///
/// `dest` must not exist. Transient failures (busy handles held by a file
/// indexer, for example) are retried with a linear backoff.
pub fn replace_dir(
    src: impl AsRef<Path>,
    dest: impl AsRef<Path>,
    options: ReplaceDirOptions,
) -> Result<()> {
    let src = src.as_ref();
    let dest = dest.as_ref();

    if !src.exists() {
        return Err(Error::NotFound(src.to_path_buf()));
    }

    let mut attempts = 0;
    loop {
        match std::fs::rename(src, dest) {
            Ok(()) => return Ok(()),
            Err(e) => {
                attempts += 1;
                let retryable = matches!(
                    e.kind(),
                    std::io::ErrorKind::ResourceBusy | std::io::ErrorKind::PermissionDenied
                );
                if !retryable || attempts >= options.retry_count {
                    return Err(Error::Rename {
                        from:   src.to_path_buf(),
                        to:     dest.to_path_buf(),
                        source: e,
                    });
                }
                std::thread::sleep(options.retry_delay * attempts);
            }
        }
    }
}
