use std::path::PathBuf;

use crate::error::{Error, Result};

/// Login name of the current user.
///
/// Resolved from the password database by uid, falling back to `$USER`.
pub fn username() -> Result<String> {
    #[cfg(unix)]
    {
        use nix::unistd::{Uid, User};
        match User::from_uid(Uid::current()) {
            Ok(Some(user)) => return Ok(user.name),
            Ok(None) => {}
            Err(e) => tracing::debug!(error = %e, "password database lookup failed"),
        }
    }

    std::env::var("USER")
        .ok()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| Error::UserLookup("no passwd entry and $USER is unset".to_string()))
}

/// Home directory of the current user.
pub fn home() -> Result<PathBuf> { crate::dir::user_home().ok_or(Error::HomeNotFound) }
